use crate::error::CacheError;
use crate::indexed_cache::PersistentIndexedCache;
use crate::lock::{LockOptions, LockedFileAccess};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Owns the lock scope of a shared cache root.
///
/// [`CacheLockingManager::use_cache`] runs work under the exclusive lock of the
/// root, and every [`PersistentIndexedCache`] handed out by
/// [`CacheLockingManager::create_cache`] shares that same scope, so index reads
/// and writes nested in `use_cache` are atomic with respect to other processes.
#[derive(Debug)]
pub struct CacheLockingManager {
    root: PathBuf,
    access: Arc<LockedFileAccess>,
}

impl CacheLockingManager {
    pub fn new(root: impl AsRef<Path>, options: LockOptions) -> Result<Self, CacheError> {
        let access = LockedFileAccess::for_directory(root, options)?;
        Ok(Self {
            root: access.target().to_path_buf(),
            access: Arc::new(access),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn access(&self) -> &Arc<LockedFileAccess> {
        &self.access
    }

    /// Runs `action` while holding the exclusive cache lock.
    ///
    /// `description` only feeds diagnostics.
    pub fn use_cache<T, E>(
        &self,
        description: &str,
        action: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<CacheError>,
    {
        let nested = self.access.held_mode().is_some();
        let start = Instant::now();
        let result = self.access.update_file(|| {
            if !nested {
                tracing::debug!(
                    target = "nova.cache",
                    root = %self.root.display(),
                    description,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "acquired artifact cache lock"
                );
            }
            action()
        });
        if !nested {
            tracing::debug!(
                target = "nova.cache",
                root = %self.root.display(),
                description,
                held_ms = start.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "released artifact cache lock"
            );
        }
        result
    }

    /// Opens (or creates) a typed index file inside this lock scope.
    ///
    /// Relative paths are resolved against the cache root.
    pub fn create_cache<K, V>(&self, file: impl AsRef<Path>) -> PersistentIndexedCache<K, V>
    where
        K: Serialize + DeserializeOwned + Eq + Hash,
        V: Serialize + DeserializeOwned,
    {
        PersistentIndexedCache::new(self.root.join(file.as_ref()), self.access.clone())
    }

    pub fn close(&self) {
        self.access.close();
    }
}
