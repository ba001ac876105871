use crate::coordinates::{ModuleDescriptor, ModuleRevisionId, RepositoryId};
use crate::error::Result;
use nova_cache::{
    atomic_write, bincode_deserialize, bincode_serialize, read_cache_file, remove_file_best_effort,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const DESCRIPTOR_STORE_SCHEMA_VERSION: u32 = 2;

const DESCRIPTOR_FILE_NAME: &str = "descriptor.bin";

#[derive(Serialize)]
struct StoredDescriptorRef<'a> {
    schema_version: u32,
    repository: &'a str,
    descriptor: &'a ModuleDescriptor,
}

#[derive(Deserialize)]
struct StoredDescriptor {
    schema_version: u32,
    repository: String,
    descriptor: ModuleDescriptor,
}

/// One file per (repository, module revision) holding the full descriptor.
///
/// The store does no locking of its own; callers run it inside the lock scope
/// of the owning cache root.
#[derive(Debug, Clone)]
pub struct ModuleDescriptorStore {
    base_dir: PathBuf,
}

impl ModuleDescriptorStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/<repository>-<hash>/<organisation>/<module>/<revision>-<hash>/descriptor.bin`
    ///
    /// Segments are sanitised, so the hashes of the raw repository id and the
    /// full revision id keep distinct keys apart.
    pub fn descriptor_path(&self, repository: &RepositoryId, id: &ModuleRevisionId) -> PathBuf {
        let revision_dir = keyed_segment(&id.revision, &id.encode_to_string());

        self.base_dir
            .join(repository_dir_name(repository.as_str()))
            .join(sanitize_segment(&id.organisation))
            .join(sanitize_segment(&id.name))
            .join(revision_dir)
            .join(DESCRIPTOR_FILE_NAME)
    }

    pub fn get_module_descriptor(
        &self,
        repository: &RepositoryId,
        id: &ModuleRevisionId,
    ) -> Result<Option<ModuleDescriptor>> {
        let path = self.descriptor_path(repository, id);
        let Some(bytes) = read_cache_file(&path)? else {
            return Ok(None);
        };

        let stored: StoredDescriptor = match bincode_deserialize(&bytes) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::debug!(
                    target = "nova.deps",
                    path = %path.display(),
                    error = %err,
                    "ignoring undecodable module descriptor"
                );
                return Ok(None);
            }
        };

        // Sanitised path segments may collide; the payload carries the real identity.
        if stored.schema_version != DESCRIPTOR_STORE_SCHEMA_VERSION
            || stored.repository != repository.as_str()
            || &stored.descriptor.id != id
        {
            tracing::debug!(
                target = "nova.deps",
                path = %path.display(),
                "ignoring module descriptor recorded for a different key"
            );
            return Ok(None);
        }

        Ok(Some(stored.descriptor))
    }

    pub fn put_module_descriptor(
        &self,
        repository: &RepositoryId,
        descriptor: &ModuleDescriptor,
    ) -> Result<PathBuf> {
        let path = self.descriptor_path(repository, &descriptor.id);
        let stored = StoredDescriptorRef {
            schema_version: DESCRIPTOR_STORE_SCHEMA_VERSION,
            repository: repository.as_str(),
            descriptor,
        };
        atomic_write(&path, &bincode_serialize(&stored)?)?;
        Ok(path)
    }

    pub fn remove_module_descriptor(&self, repository: &RepositoryId, id: &ModuleRevisionId) {
        remove_file_best_effort(
            &self.descriptor_path(repository, id),
            "descriptor_store.remove",
        );
    }
}

/// Directory name for a repository: sanitised id plus a short hash of the raw id.
pub(crate) fn repository_dir_name(raw: &str) -> String {
    keyed_segment(raw, raw)
}

fn keyed_segment(readable: &str, key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}-{}", sanitize_segment(readable), hex::encode(&digest[..4]))
}

fn sanitize_segment(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '+') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.chars().all(|ch| ch == '.') {
        out = format!("_{out}");
    }
    out
}
