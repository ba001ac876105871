use crate::artifact_cache::ArtifactResolutionCache;
use crate::coordinates::{ModuleDescriptor, ModuleRevisionId, RepositoryId};
use crate::descriptor_store::ModuleDescriptorStore;
use crate::error::{DepsCacheError, Result};
use crate::policy::CachePolicy;
use crate::time::TimeProvider;
use nova_cache::{CacheLockingManager, PersistentIndexedCache};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Index key: which repository resolved which module revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionKey {
    pub repository_id: String,
    /// Encoded [`ModuleRevisionId`]; `None` for requests without a revision id.
    pub module_revision_id: Option<String>,
}

impl RevisionKey {
    pub fn new(repository: &RepositoryId, id: Option<&ModuleRevisionId>) -> Self {
        Self {
            repository_id: repository.as_str().to_owned(),
            module_revision_id: id.map(ModuleRevisionId::encode_to_string),
        }
    }
}

/// Compact index record. Never embeds the descriptor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptorCacheEntry {
    pub is_changing_module: bool,
    pub is_missing: bool,
    pub cached_at_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedDescriptor {
    Present(ModuleDescriptor),
    /// The repository was asked and did not have the module.
    Missing,
}

impl CachedDescriptor {
    pub fn as_present(&self) -> Option<&ModuleDescriptor> {
        match self {
            CachedDescriptor::Present(descriptor) => Some(descriptor),
            CachedDescriptor::Missing => None,
        }
    }
}

/// Result of a cache lookup: the index flags plus the payload, if any.
#[derive(Debug, Clone)]
pub struct CachedModuleDescriptor {
    entry: ModuleDescriptorCacheEntry,
    descriptor: CachedDescriptor,
    age: Duration,
}

impl CachedModuleDescriptor {
    pub fn is_missing(&self) -> bool {
        matches!(self.descriptor, CachedDescriptor::Missing)
    }

    pub fn is_changing_module(&self) -> bool {
        self.entry.is_changing_module
    }

    pub fn module_descriptor(&self) -> &CachedDescriptor {
        &self.descriptor
    }

    pub fn into_module_descriptor(self) -> CachedDescriptor {
        self.descriptor
    }

    pub fn cached_at_millis(&self) -> u64 {
        self.entry.cached_at_millis
    }

    pub fn age(&self) -> Duration {
        self.age
    }

    /// Whether the policy asks for this entry to be resolved again.
    pub fn must_refresh(&self, policy: &CachePolicy) -> bool {
        policy.must_refresh_module(self.is_missing(), self.is_changing_module(), self.age)
    }
}

/// Persistent cache of resolved module descriptors, per repository.
///
/// The index (`module-metadata.bin`) and the per-revision descriptor files are
/// only touched inside [`CacheLockingManager::use_cache`], so the
/// expire-then-rewrite sequence of [`Self::cache_module_descriptor`] is atomic
/// for other processes sharing the cache root.
pub struct ModuleDescriptorCache {
    locking: Arc<CacheLockingManager>,
    index: PersistentIndexedCache<RevisionKey, ModuleDescriptorCacheEntry>,
    store: ModuleDescriptorStore,
    artifact_resolution_cache: Arc<dyn ArtifactResolutionCache>,
    time: Arc<dyn TimeProvider>,
}

impl ModuleDescriptorCache {
    pub const INDEX_FILE_NAME: &'static str = "module-metadata.bin";
    pub const STORE_DIR_NAME: &'static str = "module-metadata";

    pub fn new(
        locking: Arc<CacheLockingManager>,
        artifact_resolution_cache: Arc<dyn ArtifactResolutionCache>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let index = locking.create_cache(Self::INDEX_FILE_NAME);
        let store = ModuleDescriptorStore::new(locking.root().join(Self::STORE_DIR_NAME));
        Self {
            locking,
            index,
            store,
            artifact_resolution_cache,
            time,
        }
    }

    pub fn store(&self) -> &ModuleDescriptorStore {
        &self.store
    }

    /// Looks up a previous resolution. `None` is a plain cache miss.
    pub fn get_cached_module_descriptor(
        &self,
        repository: &RepositoryId,
        id: &ModuleRevisionId,
    ) -> Result<Option<CachedModuleDescriptor>> {
        let description = format!("Lookup module descriptor for {id} in {repository}");
        self.locking.use_cache(&description, || {
            let Some(entry) = self.index.get(&RevisionKey::new(repository, Some(id)))? else {
                tracing::trace!(
                    target = "nova.deps",
                    module = %id,
                    repository = %repository,
                    "module descriptor cache miss"
                );
                return Ok(None);
            };

            let descriptor = if entry.is_missing {
                CachedDescriptor::Missing
            } else {
                match self.store.get_module_descriptor(repository, id)? {
                    Some(descriptor) => CachedDescriptor::Present(descriptor),
                    None => {
                        tracing::debug!(
                            target = "nova.deps",
                            module = %id,
                            repository = %repository,
                            "index entry without a stored descriptor; treating as a miss"
                        );
                        return Ok(None);
                    }
                }
            };

            let now = self.time.now_millis();
            Ok(Some(CachedModuleDescriptor {
                entry,
                descriptor,
                age: Duration::from_millis(now.saturating_sub(entry.cached_at_millis)),
            }))
        })
    }

    /// Records the outcome of resolving `id` against `repository`.
    ///
    /// `None` records a negative result. A present descriptor that replaces a
    /// changing one (or is itself changing) with a different publication time
    /// first expires the artifact resolutions of the previous descriptor.
    pub fn cache_module_descriptor(
        &self,
        repository: &RepositoryId,
        id: &ModuleRevisionId,
        descriptor: Option<&ModuleDescriptor>,
        is_changing: bool,
    ) -> Result<()> {
        let description = format!("Cache module descriptor for {id} in {repository}");
        self.locking.use_cache(&description, || {
            let key = RevisionKey::new(repository, Some(id));
            match descriptor {
                None => {
                    tracing::debug!(
                        target = "nova.deps",
                        module = %id,
                        repository = %repository,
                        "caching missing module"
                    );
                    self.store.remove_module_descriptor(repository, id);
                    self.write_entry(key, is_changing, true)
                }
                Some(descriptor) => {
                    self.expire_changing_module_if_required(
                        &key,
                        repository,
                        id,
                        descriptor,
                        is_changing,
                    )?;
                    self.store.put_module_descriptor(repository, descriptor)?;
                    self.write_entry(key, is_changing, false)
                }
            }
        })
    }

    fn expire_changing_module_if_required(
        &self,
        key: &RevisionKey,
        repository: &RepositoryId,
        id: &ModuleRevisionId,
        descriptor: &ModuleDescriptor,
        is_changing: bool,
    ) -> Result<()> {
        let Some(previous) = self.index.get(key)? else {
            return Ok(());
        };
        if previous.is_missing || !(previous.is_changing_module || is_changing) {
            return Ok(());
        }
        let Some(previous_descriptor) = self.store.get_module_descriptor(repository, id)? else {
            return Ok(());
        };
        if previous_descriptor.published_at_millis == descriptor.published_at_millis {
            return Ok(());
        }

        tracing::debug!(
            target = "nova.deps",
            module = %id,
            repository = %repository,
            previous_published_at = previous_descriptor.published_at_millis,
            published_at = descriptor.published_at_millis,
            "changing module was republished; expiring its cached artifacts"
        );
        for artifact in previous_descriptor.all_artifacts() {
            self.artifact_resolution_cache
                .expire_cached_artifact_resolution(repository, artifact)?;
        }
        Ok(())
    }

    fn write_entry(&self, key: RevisionKey, is_changing: bool, is_missing: bool) -> Result<()> {
        let entry = ModuleDescriptorCacheEntry {
            is_changing_module: is_changing,
            is_missing,
            cached_at_millis: self.time.now_millis(),
        };
        self.index
            .put(key, entry)
            .map_err(DepsCacheError::from)
    }
}
