use crate::error::CacheError;
use crate::lock::LockedFileAccess;
use crate::util::{atomic_write, bincode_deserialize, bincode_serialize, read_cache_file};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Version of the on-disk indexed cache wrapper.
pub const INDEXED_CACHE_SCHEMA_VERSION: u32 = 1;

const INDEXED_CACHE_MAGIC: [u8; 8] = *b"NOVAIDX1";

#[derive(Serialize)]
struct PersistedIndex<'a, K, V> {
    magic: [u8; 8],
    schema_version: u32,
    entries: Vec<(&'a K, &'a V)>,
}

#[derive(Deserialize)]
struct PersistedIndexOwned<K, V> {
    magic: [u8; 8],
    schema_version: u32,
    entries: Vec<(K, V)>,
}

/// A typed key/value map persisted as a single file.
///
/// Reads run under a shared lock and mutations under an exclusive lock of the
/// owning [`LockedFileAccess`]. When the caller already holds that lock (for
/// example inside [`crate::CacheLockingManager::use_cache`]) the lock level is
/// left alone, so a read-modify-write sequence is atomic for other processes.
///
/// A file that fails to decode, or carries a different schema version, is
/// treated as empty and gets replaced by the next write.
pub struct PersistentIndexedCache<K, V> {
    path: PathBuf,
    access: Arc<LockedFileAccess>,
    _entries: PhantomData<fn() -> (K, V)>,
}

impl<K, V> PersistentIndexedCache<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash,
    V: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>, access: Arc<LockedFileAccess>) -> Self {
        Self {
            path: path.into(),
            access,
            _entries: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.access.read_file(|| Ok(self.load()?.remove(key)))
    }

    pub fn put(&self, key: K, value: V) -> Result<(), CacheError> {
        self.access.update_file(|| {
            let mut entries = self.load()?;
            entries.insert(key, value);
            self.save(&entries)
        })
    }

    /// Removes `key`, returning whether an entry was present.
    pub fn remove(&self, key: &K) -> Result<bool, CacheError> {
        self.access.update_file(|| {
            let mut entries = self.load()?;
            if entries.remove(key).is_none() {
                return Ok(false);
            }
            self.save(&entries)?;
            Ok(true)
        })
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        self.access.read_file(|| Ok(self.load()?.len()))
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    fn load(&self) -> Result<HashMap<K, V>, CacheError> {
        let Some(bytes) = read_cache_file(&self.path)? else {
            return Ok(HashMap::new());
        };

        match bincode_deserialize::<PersistedIndexOwned<K, V>>(&bytes) {
            Ok(index)
                if index.magic == INDEXED_CACHE_MAGIC
                    && index.schema_version == INDEXED_CACHE_SCHEMA_VERSION =>
            {
                Ok(index.entries.into_iter().collect())
            }
            Ok(index) => {
                tracing::debug!(
                    target = "nova.cache",
                    path = %self.path.display(),
                    found = index.schema_version,
                    expected = INDEXED_CACHE_SCHEMA_VERSION,
                    "discarding indexed cache with incompatible schema"
                );
                Ok(HashMap::new())
            }
            Err(err) => {
                tracing::debug!(
                    target = "nova.cache",
                    path = %self.path.display(),
                    error = %err,
                    "discarding undecodable indexed cache"
                );
                Ok(HashMap::new())
            }
        }
    }

    fn save(&self, entries: &HashMap<K, V>) -> Result<(), CacheError> {
        let persisted = PersistedIndex {
            magic: INDEXED_CACHE_MAGIC,
            schema_version: INDEXED_CACHE_SCHEMA_VERSION,
            entries: entries.iter().collect(),
        };
        atomic_write(&self.path, &bincode_serialize(&persisted)?)
    }
}

impl<K, V> fmt::Debug for PersistentIndexedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentIndexedCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
