use crate::coordinates::{ArtifactRevisionId, RepositoryId};
use crate::error::Result;
use crate::time::TimeProvider;
use nova_cache::{CacheLockingManager, PersistentIndexedCache};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Maps (repository, artifact) to the location it was last resolved to.
pub trait ArtifactResolutionCache: Send + Sync {
    /// Forgets the cached resolution so the next lookup goes back to the repository.
    fn expire_cached_artifact_resolution(
        &self,
        repository: &RepositoryId,
        artifact: &ArtifactRevisionId,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactResolutionKey {
    pub repository: RepositoryId,
    pub artifact: ArtifactRevisionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifactResolution {
    /// `None` records that the repository had no such artifact.
    pub file: Option<PathBuf>,
    pub cached_at_millis: u64,
}

impl CachedArtifactResolution {
    pub fn is_missing(&self) -> bool {
        self.file.is_none()
    }

    pub fn age(&self, now_millis: u64) -> Duration {
        Duration::from_millis(now_millis.saturating_sub(self.cached_at_millis))
    }
}

/// [`ArtifactResolutionCache`] persisted as an index file under the cache root.
pub struct DefaultArtifactResolutionCache {
    index: PersistentIndexedCache<ArtifactResolutionKey, CachedArtifactResolution>,
    time: Arc<dyn TimeProvider>,
}

impl DefaultArtifactResolutionCache {
    pub const INDEX_FILE_NAME: &'static str = "artifact-at-repository.bin";

    pub fn new(locking: &CacheLockingManager, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            index: locking.create_cache(Self::INDEX_FILE_NAME),
            time,
        }
    }

    /// Records where `artifact` was resolved to; `None` caches a miss.
    pub fn store_artifact_file(
        &self,
        repository: &RepositoryId,
        artifact: &ArtifactRevisionId,
        file: Option<&Path>,
    ) -> Result<()> {
        let entry = CachedArtifactResolution {
            file: file.map(Path::to_path_buf),
            cached_at_millis: self.time.now_millis(),
        };
        self.index.put(key(repository, artifact), entry)?;
        Ok(())
    }

    /// Returns the cached resolution, dropping it when the file has since disappeared.
    pub fn get_cached_artifact_resolution(
        &self,
        repository: &RepositoryId,
        artifact: &ArtifactRevisionId,
    ) -> Result<Option<CachedArtifactResolution>> {
        let key = key(repository, artifact);
        let Some(entry) = self.index.get(&key)? else {
            return Ok(None);
        };
        if let Some(file) = &entry.file {
            if !file.is_file() {
                tracing::debug!(
                    target = "nova.deps",
                    artifact = %artifact,
                    file = %file.display(),
                    "cached artifact file vanished; dropping resolution"
                );
                self.index.remove(&key)?;
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    pub fn now_millis(&self) -> u64 {
        self.time.now_millis()
    }
}

impl ArtifactResolutionCache for DefaultArtifactResolutionCache {
    fn expire_cached_artifact_resolution(
        &self,
        repository: &RepositoryId,
        artifact: &ArtifactRevisionId,
    ) -> Result<()> {
        if self.index.remove(&key(repository, artifact))? {
            tracing::debug!(
                target = "nova.deps",
                repository = %repository,
                artifact = %artifact,
                "expired cached artifact resolution"
            );
        }
        Ok(())
    }
}

fn key(repository: &RepositoryId, artifact: &ArtifactRevisionId) -> ArtifactResolutionKey {
    ArtifactResolutionKey {
        repository: repository.clone(),
        artifact: artifact.clone(),
    }
}
