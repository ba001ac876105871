use super::listener::{TransferListener, TransferListeners};
use super::{
    with_trailing_slash, CacheManagerAware, RepositoryCacheManager, RepositoryTransport,
    ResourceCollection, ResourceInfo, TransferOutcome,
};
use crate::coordinates::ArtifactRevisionId;
use crate::error::{sanitize_url, DepsCacheError, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use url::Url;

/// Reads repository resources straight from the local filesystem.
#[derive(Debug)]
pub struct FileResourceCollection {
    name: String,
    listeners: TransferListeners,
}

impl FileResourceCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: TransferListeners::default(),
        }
    }

    fn resolve(source: &str) -> Result<PathBuf> {
        if !source.starts_with("file:") {
            return Ok(PathBuf::from(source));
        }
        Url::parse(source)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| DepsCacheError::UnsupportedUrl {
                url: sanitize_url(source),
            })
    }
}

impl ResourceCollection for FileResourceCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_resource(&self, source: &str) -> Result<Option<ResourceInfo>> {
        let path = Self::resolve(source)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(ResourceInfo {
                name: source.to_owned(),
                content_length: Some(meta.len()),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn get(
        &self,
        source: &str,
        _artifact: Option<&ArtifactRevisionId>,
        destination: &Path,
    ) -> Result<Option<TransferOutcome>> {
        let path = Self::resolve(source)?;
        self.listeners.initiated(source);

        let mut reader = match File::open(&path) {
            Ok(file) if path.is_file() => file,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                self.listeners.failed(source, None, 0, &err);
                return Err(err.into());
            }
        };
        let total_length = reader.metadata().ok().map(|meta| meta.len());

        let mut bytes = 0;
        nova_cache::atomic_write_with(destination, |out| {
            bytes = self
                .listeners
                .copy_with_progress(source, total_length, &mut reader, out)?;
            Ok::<_, DepsCacheError>(())
        })?;
        Ok(Some(TransferOutcome::Downloaded { bytes }))
    }

    fn add_transfer_listener(&self, listener: Arc<dyn TransferListener>) {
        self.listeners.add(listener);
    }

    fn remove_transfer_listener(&self, listener: &Arc<dyn TransferListener>) {
        self.listeners.remove(listener);
    }

    fn has_transfer_listener(&self, listener: &Arc<dyn TransferListener>) -> bool {
        self.listeners.contains(listener)
    }
}

/// Transport for `file:` repositories.
#[derive(Debug)]
pub struct FileTransport {
    name: String,
    accessor: OnceLock<Arc<FileResourceCollection>>,
}

impl FileTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accessor: OnceLock::new(),
        }
    }
}

impl RepositoryTransport for FileTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn repository_accessor(&self) -> Result<Arc<dyn ResourceCollection>> {
        let accessor = self
            .accessor
            .get_or_init(|| Arc::new(FileResourceCollection::new(self.name.clone())));
        Ok(accessor.clone())
    }

    fn configure_cache_manager(&self, resolver: &mut dyn CacheManagerAware) {
        resolver.set_repository_cache_manager(RepositoryCacheManager::LocalFile {
            repository: self.name.clone(),
        });
    }

    fn convert_to_path(&self, uri: &Url) -> Result<String> {
        let path = uri
            .to_file_path()
            .map_err(|()| DepsCacheError::UnsupportedUrl {
                url: sanitize_url(uri.as_str()),
            })?;
        let path = std::path::absolute(&path)?;
        Ok(with_trailing_slash(path.to_string_lossy().into_owned()))
    }
}
