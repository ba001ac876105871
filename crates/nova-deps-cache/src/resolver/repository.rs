use super::{
    ArtifactDownloadReport, ArtifactOrigin, DependencyDescriptor, DependencyResolver,
    DownloadOptions, DownloadReport, DownloadStatus, ResolveData, ResolvedModuleRevision,
    ResolvedResource,
};
use crate::artifact_cache::DefaultArtifactResolutionCache;
use crate::coordinates::{ArtifactRevisionId, ModuleDescriptor, ModuleRevisionId, RepositoryId};
use crate::descriptor_store::repository_dir_name;
use crate::error::{sanitize_url, DepsCacheError, Result};
use crate::module_cache::{CachedDescriptor, ModuleDescriptorCache};
use crate::pattern::artifact_path;
use crate::policy::CachePolicy;
use crate::transport::{CacheManagerAware, RepositoryCacheManager, RepositoryTransport};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Maven-style repository layout.
pub const DEFAULT_ARTIFACT_PATTERN: &str =
    "[organisation-path]/[module]/[revision]/[artifact]-[revision](-[classifier]).[ext]";

/// Layout of downloaded files below each repository's download directory.
pub const DOWNLOAD_LAYOUT: &str =
    "[organisation]/[module]/[revision]/[artifact]-[revision](-[classifier]).[ext]";

/// Turns a fetched metadata file into a [`ModuleDescriptor`].
///
/// Metadata formats belong to the resolution engine; the resolver only fetches
/// and caches.
pub trait ModuleDescriptorParser: Send + Sync {
    fn parse(&self, id: &ModuleRevisionId, file: &Path) -> Result<ModuleDescriptor>;
}

/// The caches a [`RepositoryResolver`] records its outcomes in.
#[derive(Clone)]
pub struct ResolverCaches {
    pub module_descriptors: Arc<ModuleDescriptorCache>,
    pub artifact_resolutions: Arc<DefaultArtifactResolutionCache>,
    /// Root of the downloaded-file tree; each repository gets a subdirectory.
    pub files_dir: PathBuf,
    pub policy: CachePolicy,
}

/// Resolves modules and artifacts from a single repository transport.
///
/// Outcomes, including "not there", are recorded in the module descriptor and
/// artifact resolution caches and served from them while the [`CachePolicy`]
/// considers them fresh.
pub struct RepositoryResolver {
    name: String,
    repository_id: RepositoryId,
    root: String,
    artifact_pattern: String,
    transport: Arc<dyn RepositoryTransport>,
    cache_manager: RepositoryCacheManager,
    parser: Arc<dyn ModuleDescriptorParser>,
    caches: ResolverCaches,
    download_dir: PathBuf,
}

impl CacheManagerAware for RepositoryResolver {
    fn set_repository_cache_manager(&mut self, manager: RepositoryCacheManager) {
        self.cache_manager = manager;
    }
}

impl RepositoryResolver {
    pub fn new(
        name: impl Into<String>,
        root_url: &Url,
        transport: Arc<dyn RepositoryTransport>,
        parser: Arc<dyn ModuleDescriptorParser>,
        caches: ResolverCaches,
    ) -> Result<Self> {
        let name = name.into();
        let root = transport.convert_to_path(root_url)?;
        let download_dir = caches.files_dir.join(repository_dir_name(&name));
        let mut resolver = Self {
            repository_id: RepositoryId::new(name.clone()),
            name,
            root,
            artifact_pattern: DEFAULT_ARTIFACT_PATTERN.to_owned(),
            transport: transport.clone(),
            cache_manager: RepositoryCacheManager::Shared,
            parser,
            caches,
            download_dir,
        };
        transport.configure_cache_manager(&mut resolver);
        Ok(resolver)
    }

    pub fn with_artifact_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.artifact_pattern = pattern.into();
        self
    }

    pub fn repository_id(&self) -> &RepositoryId {
        &self.repository_id
    }

    /// The normalised repository root; always ends with `/`.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn cache_manager(&self) -> &RepositoryCacheManager {
        &self.cache_manager
    }

    fn uses_files_in_place(&self) -> bool {
        matches!(self.cache_manager, RepositoryCacheManager::LocalFile { .. })
    }

    fn source_of(&self, artifact: &ArtifactRevisionId) -> Result<String> {
        Ok(format!(
            "{}{}",
            self.root,
            artifact_path(&self.artifact_pattern, artifact)?
        ))
    }

    fn descriptor_artifact(id: &ModuleRevisionId) -> ArtifactRevisionId {
        ArtifactRevisionId::new(id.clone(), id.name.clone(), "ivy", "xml")
    }

    /// Where a downloaded copy of `artifact` lives.
    fn download_path(&self, artifact: &ArtifactRevisionId) -> Result<PathBuf> {
        let relative = PathBuf::from(artifact_path(DOWNLOAD_LAYOUT, artifact)?);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(DepsCacheError::InvalidPath { path: relative });
        }
        Ok(self.download_dir.join(relative))
    }

    fn cached_report(
        &self,
        artifact: &ArtifactRevisionId,
        options: &DownloadOptions,
    ) -> Result<Option<ArtifactDownloadReport>> {
        if options.force || self.uses_files_in_place() {
            return Ok(None);
        }
        let cache = &self.caches.artifact_resolutions;
        let Some(cached) = cache.get_cached_artifact_resolution(&self.repository_id, artifact)?
        else {
            return Ok(None);
        };
        let age = cached.age(cache.now_millis());
        match cached.file {
            Some(file) => Ok(Some(ArtifactDownloadReport {
                artifact: artifact.clone(),
                status: DownloadStatus::Cached,
                local_file: Some(file),
                origin: None,
            })),
            None if !self.caches.policy.must_refresh_missing_artifact(age) => {
                Ok(Some(ArtifactDownloadReport::no_file(artifact.clone())))
            }
            None => Ok(None),
        }
    }

    fn fetch(&self, origin: &ArtifactOrigin) -> Result<ArtifactDownloadReport> {
        let artifact = &origin.artifact;
        if self.uses_files_in_place() {
            let file = PathBuf::from(&origin.location);
            if !file.is_file() {
                return Ok(ArtifactDownloadReport::no_file(artifact.clone()));
            }
            return Ok(ArtifactDownloadReport {
                artifact: artifact.clone(),
                status: DownloadStatus::Successful,
                local_file: Some(file),
                origin: Some(origin.clone()),
            });
        }

        let destination = self.download_path(artifact)?;
        let accessor = self.transport.repository_accessor()?;
        let fetched = accessor.get(&origin.location, Some(artifact), &destination)?;
        let cache = &self.caches.artifact_resolutions;
        match fetched {
            Some(outcome) => {
                tracing::debug!(
                    target = "nova.deps",
                    artifact = %artifact,
                    repository = %self.repository_id,
                    ?outcome,
                    "fetched artifact"
                );
                cache.store_artifact_file(&self.repository_id, artifact, Some(&destination))?;
                Ok(ArtifactDownloadReport {
                    artifact: artifact.clone(),
                    status: DownloadStatus::Successful,
                    local_file: Some(destination),
                    origin: Some(origin.clone()),
                })
            }
            None => {
                cache.store_artifact_file(&self.repository_id, artifact, None)?;
                Ok(ArtifactDownloadReport::no_file(artifact.clone()))
            }
        }
    }

    fn download_one(
        &self,
        artifact: &ArtifactRevisionId,
        options: &DownloadOptions,
    ) -> Result<ArtifactDownloadReport> {
        if let Some(report) = self.cached_report(artifact, options)? {
            return Ok(report);
        }
        match self.locate(artifact)? {
            Some(origin) => self.fetch(&origin),
            None => {
                if !self.uses_files_in_place() {
                    self.caches.artifact_resolutions.store_artifact_file(
                        &self.repository_id,
                        artifact,
                        None,
                    )?;
                }
                Ok(ArtifactDownloadReport::no_file(artifact.clone()))
            }
        }
    }

    fn resolve_descriptor(
        &self,
        dependency: &DependencyDescriptor,
        data: &ResolveData,
    ) -> Result<Option<ModuleDescriptor>> {
        let id = &dependency.dependency_revision_id;
        let modules = &self.caches.module_descriptors;
        let record_missing =
            || modules.cache_module_descriptor(&self.repository_id, id, None, dependency.changing);

        let Some(resource) = self.find_ivy_file_ref(dependency, data)? else {
            record_missing()?;
            return Ok(None);
        };

        let descriptor_artifact = Self::descriptor_artifact(id);
        let file = if self.uses_files_in_place() {
            PathBuf::from(&resource.location)
        } else {
            let destination = self.download_path(&descriptor_artifact)?;
            let accessor = self.transport.repository_accessor()?;
            if accessor
                .get(&resource.location, Some(&descriptor_artifact), &destination)?
                .is_none()
            {
                record_missing()?;
                return Ok(None);
            }
            destination
        };

        let descriptor = self.parser.parse(id, &file)?;
        modules.cache_module_descriptor(
            &self.repository_id,
            id,
            Some(&descriptor),
            dependency.changing,
        )?;
        Ok(Some(descriptor))
    }
}

impl fmt::Debug for RepositoryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryResolver")
            .field("name", &self.name)
            .field("root", &sanitize_url(&self.root))
            .field("cache_manager", &self.cache_manager)
            .finish_non_exhaustive()
    }
}

impl DependencyResolver for RepositoryResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_dependency(
        &self,
        dependency: &DependencyDescriptor,
        data: &ResolveData,
    ) -> Result<Option<ResolvedModuleRevision>> {
        let id = &dependency.dependency_revision_id;
        let cached = self
            .caches
            .module_descriptors
            .get_cached_module_descriptor(&self.repository_id, id)?;

        let descriptor = match cached {
            Some(cached) if !data.refresh && !cached.must_refresh(&self.caches.policy) => {
                tracing::trace!(
                    target = "nova.deps",
                    module = %id,
                    repository = %self.repository_id,
                    missing = cached.is_missing(),
                    "serving module from descriptor cache"
                );
                match cached.into_module_descriptor() {
                    CachedDescriptor::Present(descriptor) => Some(descriptor),
                    CachedDescriptor::Missing => None,
                }
            }
            _ => self.resolve_descriptor(dependency, data)?,
        };

        Ok(descriptor.map(|descriptor| ResolvedModuleRevision {
            resolver: self.name.clone(),
            descriptor,
            is_changing: dependency.changing,
        }))
    }

    fn find_ivy_file_ref(
        &self,
        dependency: &DependencyDescriptor,
        _data: &ResolveData,
    ) -> Result<Option<ResolvedResource>> {
        let id = &dependency.dependency_revision_id;
        let location = self.source_of(&Self::descriptor_artifact(id))?;
        let accessor = self.transport.repository_accessor()?;
        Ok(accessor
            .get_resource(&location)?
            .map(|resource| ResolvedResource {
                location: resource.name,
                revision: id.revision.clone(),
            }))
    }

    fn download_artifact(
        &self,
        origin: &ArtifactOrigin,
        options: &DownloadOptions,
    ) -> Result<ArtifactDownloadReport> {
        if let Some(report) = self.cached_report(&origin.artifact, options)? {
            return Ok(report);
        }
        self.fetch(origin)
    }

    fn download(
        &self,
        artifacts: &[ArtifactRevisionId],
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        let artifacts = artifacts
            .iter()
            .map(|artifact| self.download_one(artifact, options))
            .collect::<Result<Vec<_>>>()?;
        Ok(DownloadReport { artifacts })
    }

    fn exists(&self, artifact: &ArtifactRevisionId) -> Result<bool> {
        Ok(self.locate(artifact)?.is_some())
    }

    fn locate(&self, artifact: &ArtifactRevisionId) -> Result<Option<ArtifactOrigin>> {
        let location = self.source_of(artifact)?;
        let accessor = self.transport.repository_accessor()?;
        Ok(accessor
            .get_resource(&location)?
            .map(|resource| ArtifactOrigin {
                artifact: artifact.clone(),
                location: resource.name,
                is_local: self.uses_files_in_place(),
            }))
    }
}
