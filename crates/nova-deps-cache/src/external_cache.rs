use crate::coordinates::ArtifactRevisionId;
use crate::error::{DepsCacheError, Result};
use crate::pattern::{artifact_glob, literal_dir_prefix};
use globset::GlobBuilder;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use walkdir::WalkDir;

/// A local file that may hold the bytes of an artifact.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    file: PathBuf,
    artifact: ArtifactRevisionId,
    sha256: OnceLock<String>,
}

impl CachedArtifact {
    pub fn new(file: impl Into<PathBuf>, artifact: ArtifactRevisionId) -> Self {
        Self {
            file: file.into(),
            artifact,
            sha256: OnceLock::new(),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn artifact(&self) -> &ArtifactRevisionId {
        &self.artifact
    }

    /// Lowercase hex SHA-256 of the file contents, computed on first use.
    pub fn sha256(&self) -> Result<String> {
        if let Some(digest) = self.sha256.get() {
            return Ok(digest.clone());
        }
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(&self.file)?, &mut hasher)?;
        let digest = hex::encode(hasher.finalize());
        Ok(self.sha256.get_or_init(|| digest).clone())
    }
}

/// Source of locally available copies of artifacts.
pub trait ExternalArtifactCache: Send + Sync {
    /// Appends every local candidate for `artifact` to `into`.
    fn add_matching_cached_artifacts(
        &self,
        artifact: Option<&ArtifactRevisionId>,
        into: &mut Vec<CachedArtifact>,
    ) -> Result<()>;
}

/// Lists the regular files below a directory.
pub trait FileTree: Send + Sync + fmt::Debug {
    /// Every file under `dir`, recursively, in visitation order. A missing
    /// directory has no files.
    fn files_under(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WalkDirFileTree;

impl FileTree for WalkDirFileTree {
    fn files_under(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

/// Fixed list of files, for exercising scans without touching the disk.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemoryFileTree {
    files: Vec<PathBuf>,
}

#[cfg(test)]
impl InMemoryFileTree {
    pub(crate) fn new(files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
impl FileTree for InMemoryFileTree {
    fn files_under(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .files
            .iter()
            .filter(|file| file.starts_with(dir))
            .cloned()
            .collect())
    }
}

/// Finds previously downloaded artifacts by probing a directory tree laid out
/// according to an Ivy pattern.
///
/// There is no index: the filesystem is the source of truth, and results come
/// back in the tree's visitation order.
#[derive(Debug, Clone)]
pub struct PatternBasedExternalArtifactCache {
    base_dir: PathBuf,
    pattern: String,
    tree: Arc<dyn FileTree>,
}

impl PatternBasedExternalArtifactCache {
    pub fn new(base_dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self::with_file_tree(base_dir, pattern, Arc::new(WalkDirFileTree))
    }

    pub fn with_file_tree(
        base_dir: impl Into<PathBuf>,
        pattern: impl Into<String>,
        tree: Arc<dyn FileTree>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            pattern: pattern.into(),
            tree,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The glob (relative to the base directory) that candidate files of
    /// `artifact` must match.
    pub fn artifact_pattern(&self, artifact: &ArtifactRevisionId) -> Result<String> {
        artifact_glob(&self.pattern, artifact)
    }
}

impl ExternalArtifactCache for PatternBasedExternalArtifactCache {
    fn add_matching_cached_artifacts(
        &self,
        artifact: Option<&ArtifactRevisionId>,
        into: &mut Vec<CachedArtifact>,
    ) -> Result<()> {
        let Some(artifact) = artifact else {
            return Ok(());
        };

        let glob = self.artifact_pattern(artifact)?;
        let matcher = GlobBuilder::new(&glob)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|err| DepsCacheError::InvalidPattern {
                pattern: glob.clone(),
                message: err.to_string(),
            })?
            .compile_matcher();

        let scan_root = self.base_dir.join(literal_dir_prefix(&glob));
        let before = into.len();
        for file in self.tree.files_under(&scan_root)? {
            let Ok(relative) = file.strip_prefix(&self.base_dir) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if matcher.is_match(&relative) {
                into.push(CachedArtifact::new(file, artifact.clone()));
            }
        }

        tracing::debug!(
            target = "nova.deps",
            artifact = %artifact,
            pattern = %glob,
            candidates = into.len() - before,
            "scanned local artifact cache"
        );
        Ok(())
    }
}
