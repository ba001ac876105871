use super::file::FileTransport;
use super::http::{HttpSettings, HttpTransport};
use super::listener::{ProgressLoggingTransferListener, TransferListener};
use super::{CacheManagerAware, PasswordCredentials, RepositoryTransport, ResourceCollection};
use crate::error::{sanitize_url, DepsCacheError, Result};
use crate::external_cache::ExternalArtifactCache;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Builds transports for repository declarations.
///
/// Every transport is wrapped in a [`ListeningRepositoryTransport`] sharing one
/// progress listener.
pub struct RepositoryTransportFactory {
    external_cache: Arc<dyn ExternalArtifactCache>,
    transfer_listener: Arc<dyn TransferListener>,
    http_settings: HttpSettings,
}

impl RepositoryTransportFactory {
    pub fn new(external_cache: Arc<dyn ExternalArtifactCache>) -> Self {
        Self::with_listener(external_cache, Arc::new(ProgressLoggingTransferListener::new()))
    }

    pub fn with_listener(
        external_cache: Arc<dyn ExternalArtifactCache>,
        transfer_listener: Arc<dyn TransferListener>,
    ) -> Self {
        Self {
            external_cache,
            transfer_listener,
            http_settings: HttpSettings::default(),
        }
    }

    /// Timeouts applied to every HTTP transport built afterwards.
    pub fn with_http_settings(mut self, settings: HttpSettings) -> Self {
        self.http_settings = HttpSettings {
            credentials: None,
            ..settings
        };
        self
    }

    pub fn transfer_listener(&self) -> &Arc<dyn TransferListener> {
        &self.transfer_listener
    }

    pub fn create_http_transport(
        &self,
        name: impl Into<String>,
        credentials: Option<PasswordCredentials>,
    ) -> ListeningRepositoryTransport {
        let settings = HttpSettings {
            credentials,
            ..self.http_settings.clone()
        };
        self.decorate(Box::new(HttpTransport::new(
            name,
            settings,
            self.external_cache.clone(),
        )))
    }

    pub fn create_file_transport(&self, name: impl Into<String>) -> ListeningRepositoryTransport {
        self.decorate(Box::new(FileTransport::new(name)))
    }

    /// Picks the transport for `url` by scheme.
    pub fn create_transport(
        &self,
        name: impl Into<String>,
        url: &str,
        credentials: Option<PasswordCredentials>,
    ) -> Result<ListeningRepositoryTransport> {
        let unsupported = || DepsCacheError::UnsupportedUrl {
            url: sanitize_url(url),
        };
        let parsed = Url::parse(url).map_err(|_| unsupported())?;
        match parsed.scheme() {
            "file" => Ok(self.create_file_transport(name)),
            "http" | "https" => Ok(self.create_http_transport(name, credentials)),
            _ => Err(unsupported()),
        }
    }

    fn decorate(&self, delegate: Box<dyn RepositoryTransport>) -> ListeningRepositoryTransport {
        ListeningRepositoryTransport {
            delegate,
            transfer_listener: self.transfer_listener.clone(),
        }
    }
}

impl fmt::Debug for RepositoryTransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryTransportFactory")
            .field("http_settings", &self.http_settings)
            .finish_non_exhaustive()
    }
}

/// A transport whose accessor always carries the factory's transfer listener.
pub struct ListeningRepositoryTransport {
    delegate: Box<dyn RepositoryTransport>,
    transfer_listener: Arc<dyn TransferListener>,
}

impl ListeningRepositoryTransport {
    pub fn new(
        delegate: Box<dyn RepositoryTransport>,
        transfer_listener: Arc<dyn TransferListener>,
    ) -> Self {
        Self {
            delegate,
            transfer_listener,
        }
    }
}

impl RepositoryTransport for ListeningRepositoryTransport {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn repository_accessor(&self) -> Result<Arc<dyn ResourceCollection>> {
        let accessor = self.delegate.repository_accessor()?;
        if !accessor.has_transfer_listener(&self.transfer_listener) {
            accessor.add_transfer_listener(self.transfer_listener.clone());
        }
        Ok(accessor)
    }

    fn configure_cache_manager(&self, resolver: &mut dyn CacheManagerAware) {
        self.delegate.configure_cache_manager(resolver);
    }

    fn convert_to_path(&self, uri: &Url) -> Result<String> {
        self.delegate.convert_to_path(uri)
    }
}

impl fmt::Debug for ListeningRepositoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListeningRepositoryTransport")
            .field("name", &self.delegate.name())
            .finish_non_exhaustive()
    }
}
