use crate::artifact_cache::DefaultArtifactResolutionCache;
use crate::error::{sanitize_url, DepsCacheError, Result};
use crate::external_cache::PatternBasedExternalArtifactCache;
use crate::module_cache::ModuleDescriptorCache;
use crate::policy::CachePolicy;
use crate::resolver::{
    DependencyResolver, LoopbackResolver, ModuleDescriptorParser, RepositoryResolver,
    ResolverCaches, DOWNLOAD_LAYOUT,
};
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::transport::{PasswordCredentials, RepositoryTransportFactory};
use nova_cache::{CacheConfig, CacheLockingManager, LockOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// The dependency-resolution cache of one cache root.
///
/// Layout below `<cache root>/resolution/`:
///
/// - `cache.lock`: lock scope shared by every index below
/// - `module-metadata.bin`, `module-metadata/`: module descriptor cache
/// - `artifact-at-repository.bin`: artifact resolution cache
/// - `files/<repository>-<hash>/...`: downloaded files, also scanned as the local
///   candidate cache for HTTP transports
pub struct ResolutionCache {
    locking: Arc<CacheLockingManager>,
    artifact_resolutions: Arc<DefaultArtifactResolutionCache>,
    module_descriptors: Arc<ModuleDescriptorCache>,
    external_cache: Arc<PatternBasedExternalArtifactCache>,
    transport_factory: RepositoryTransportFactory,
    files_dir: PathBuf,
    policy: CachePolicy,
}

impl ResolutionCache {
    pub const DIR_NAME: &'static str = "resolution";
    pub const FILES_DIR_NAME: &'static str = "files";

    pub fn open(config: &CacheConfig) -> Result<Self> {
        let root = config.cache_root()?.join(Self::DIR_NAME);
        Self::open_at(root, config.lock_options())
    }

    pub fn open_at(root: impl AsRef<Path>, options: LockOptions) -> Result<Self> {
        Self::open_with_time(root, options, Arc::new(SystemTimeProvider))
    }

    pub fn open_with_time(
        root: impl AsRef<Path>,
        options: LockOptions,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        let locking = Arc::new(CacheLockingManager::new(root.as_ref(), options)?);
        let artifact_resolutions = Arc::new(DefaultArtifactResolutionCache::new(
            &locking,
            time.clone(),
        ));
        let module_descriptors = Arc::new(ModuleDescriptorCache::new(
            locking.clone(),
            artifact_resolutions.clone(),
            time,
        ));
        let files_dir = locking.root().join(Self::FILES_DIR_NAME);
        let external_cache = Arc::new(PatternBasedExternalArtifactCache::new(
            &files_dir,
            format!("*/{DOWNLOAD_LAYOUT}"),
        ));
        let transport_factory = RepositoryTransportFactory::new(external_cache.clone());

        tracing::debug!(
            target = "nova.deps",
            root = %locking.root().display(),
            "opened resolution cache"
        );
        Ok(Self {
            locking,
            artifact_resolutions,
            module_descriptors,
            external_cache,
            transport_factory,
            files_dir,
            policy: CachePolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        self.locking.root()
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn locking(&self) -> &Arc<CacheLockingManager> {
        &self.locking
    }

    pub fn module_descriptor_cache(&self) -> &Arc<ModuleDescriptorCache> {
        &self.module_descriptors
    }

    pub fn artifact_resolution_cache(&self) -> &Arc<DefaultArtifactResolutionCache> {
        &self.artifact_resolutions
    }

    pub fn external_artifact_cache(&self) -> &Arc<PatternBasedExternalArtifactCache> {
        &self.external_cache
    }

    pub fn transport_factory(&self) -> &RepositoryTransportFactory {
        &self.transport_factory
    }

    /// Wraps `delegate` so each of its calls runs inside this cache's lock scope.
    pub fn loopback_resolver(
        &self,
        name: impl Into<String>,
        delegate: Arc<dyn DependencyResolver>,
    ) -> LoopbackResolver {
        LoopbackResolver::new(name, delegate, self.locking.clone())
    }

    /// A resolver for the repository at `url`, with its transport picked by scheme.
    pub fn repository_resolver(
        &self,
        name: &str,
        url: &str,
        credentials: Option<PasswordCredentials>,
        parser: Arc<dyn ModuleDescriptorParser>,
    ) -> Result<RepositoryResolver> {
        let root_url = Url::parse(url).map_err(|_| DepsCacheError::UnsupportedUrl {
            url: sanitize_url(url),
        })?;
        let transport = self
            .transport_factory
            .create_transport(name, url, credentials)?;
        RepositoryResolver::new(
            name,
            &root_url,
            Arc::new(transport),
            parser,
            ResolverCaches {
                module_descriptors: self.module_descriptors.clone(),
                artifact_resolutions: self.artifact_resolutions.clone(),
                files_dir: self.files_dir.clone(),
                policy: self.policy,
            },
        )
    }

    /// Releases the lock scope. Later cache operations fail with a
    /// [`nova_cache::CacheError::LockClosed`] error.
    pub fn close(&self) {
        self.locking.close();
    }
}
