use super::{DependencyResolver, DownloadOptions};
use crate::coordinates::ArtifactRevisionId;
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Maps an artifact to a local file, if this source can provide one.
pub trait ArtifactToFileResolver: Send + Sync {
    fn resolve(&self, artifact: &ArtifactRevisionId) -> Result<Option<PathBuf>>;
}

impl<F> ArtifactToFileResolver for F
where
    F: Fn(&ArtifactRevisionId) -> Result<Option<PathBuf>> + Send + Sync,
{
    fn resolve(&self, artifact: &ArtifactRevisionId) -> Result<Option<PathBuf>> {
        self(artifact)
    }
}

/// Asks the project resolver first; only when the current build has nothing
/// for the artifact does the repository resolver get a turn.
pub struct ArtifactToFileResolverChain {
    project_resolver: Arc<dyn ArtifactToFileResolver>,
    repository_resolver: Arc<dyn ArtifactToFileResolver>,
}

impl ArtifactToFileResolverChain {
    pub fn new(
        project_resolver: Arc<dyn ArtifactToFileResolver>,
        repository_resolver: Arc<dyn ArtifactToFileResolver>,
    ) -> Self {
        Self {
            project_resolver,
            repository_resolver,
        }
    }
}

impl ArtifactToFileResolver for ArtifactToFileResolverChain {
    fn resolve(&self, artifact: &ArtifactRevisionId) -> Result<Option<PathBuf>> {
        if let Some(file) = self.project_resolver.resolve(artifact)? {
            tracing::trace!(
                target = "nova.deps",
                artifact = %artifact,
                file = %file.display(),
                "resolved artifact from project output"
            );
            return Ok(Some(file));
        }
        self.repository_resolver.resolve(artifact)
    }
}

/// Adapts a [`DependencyResolver`] into an [`ArtifactToFileResolver`] by
/// downloading the artifact and returning the local file.
pub struct DownloadingArtifactResolver {
    resolver: Arc<dyn DependencyResolver>,
    options: DownloadOptions,
}

impl DownloadingArtifactResolver {
    pub fn new(resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            resolver,
            options: DownloadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }
}

impl ArtifactToFileResolver for DownloadingArtifactResolver {
    fn resolve(&self, artifact: &ArtifactRevisionId) -> Result<Option<PathBuf>> {
        let report = self
            .resolver
            .download(std::slice::from_ref(artifact), &self.options)?;
        Ok(report
            .report_for(artifact)
            .and_then(|report| report.local_file.clone()))
    }
}
