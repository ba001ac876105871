//! Resolver plumbing between the resolution engine and the cache.
//!
//! - [`LoopbackResolver`] runs every call of a delegate inside the cache lock
//! - [`ArtifactToFileResolverChain`] prefers files built by the current project
//!   over anything fetched from a repository
//! - [`RepositoryResolver`] serves artifacts from one repository transport,
//!   recording outcomes in the resolution caches

mod chain;
mod loopback;
mod repository;

pub use chain::{ArtifactToFileResolver, ArtifactToFileResolverChain, DownloadingArtifactResolver};
pub use loopback::LoopbackResolver;
pub use repository::{
    ModuleDescriptorParser, RepositoryResolver, ResolverCaches, DEFAULT_ARTIFACT_PATTERN,
    DOWNLOAD_LAYOUT,
};

use crate::coordinates::{ArtifactRevisionId, ModuleDescriptor, ModuleRevisionId};
use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A request for a module, as declared by a dependent module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDescriptor {
    pub dependency_revision_id: ModuleRevisionId,
    pub changing: bool,
    pub transitive: bool,
}

impl DependencyDescriptor {
    pub fn new(dependency_revision_id: ModuleRevisionId) -> Self {
        Self {
            dependency_revision_id,
            changing: false,
            transitive: true,
        }
    }

    pub fn changing(mut self, changing: bool) -> Self {
        self.changing = changing;
        self
    }
}

impl fmt::Display for DependencyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency: {}", self.dependency_revision_id)?;
        if self.changing {
            f.write_str(" (changing)")?;
        }
        Ok(())
    }
}

/// Per-resolution context handed to resolvers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveData {
    /// Re-check cached results against the repository.
    pub refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModuleRevision {
    pub resolver: String,
    pub descriptor: ModuleDescriptor,
    pub is_changing: bool,
}

/// Where an artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOrigin {
    pub artifact: ArtifactRevisionId,
    pub location: String,
    pub is_local: bool,
}

impl fmt::Display for ArtifactOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.artifact, self.location)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Ignore cached resolutions and fetch again.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Fetched from the repository during this call.
    Successful,
    /// Served from a previous resolution.
    Cached,
    /// The repository has no such artifact.
    NoFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDownloadReport {
    pub artifact: ArtifactRevisionId,
    pub status: DownloadStatus,
    pub local_file: Option<PathBuf>,
    pub origin: Option<ArtifactOrigin>,
}

impl ArtifactDownloadReport {
    pub fn no_file(artifact: ArtifactRevisionId) -> Self {
        Self {
            artifact,
            status: DownloadStatus::NoFile,
            local_file: None,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub artifacts: Vec<ArtifactDownloadReport>,
}

impl DownloadReport {
    pub fn report_for(&self, artifact: &ArtifactRevisionId) -> Option<&ArtifactDownloadReport> {
        self.artifacts
            .iter()
            .find(|report| &report.artifact == artifact)
    }
}

/// A located metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub location: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrganisationEntry {
    pub organisation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleEntry {
    pub organisation: String,
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionEntry {
    pub module: ModuleEntry,
    pub revision: String,
}

/// Ambient settings the resolution engine pushes into resolvers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverSettings {
    pub default_cache_dir: Option<PathBuf>,
    pub variables: BTreeMap<String, String>,
}

/// A source of modules and artifacts.
///
/// Listing operations default to empty results; resolvers that can enumerate
/// their contents override them.
pub trait DependencyResolver: Send + Sync {
    fn name(&self) -> &str;

    fn set_settings(&self, _settings: &ResolverSettings) {}

    fn get_dependency(
        &self,
        dependency: &DependencyDescriptor,
        data: &ResolveData,
    ) -> Result<Option<ResolvedModuleRevision>>;

    /// Locates the metadata file describing `dependency`.
    fn find_ivy_file_ref(
        &self,
        dependency: &DependencyDescriptor,
        data: &ResolveData,
    ) -> Result<Option<ResolvedResource>>;

    fn download_artifact(
        &self,
        origin: &ArtifactOrigin,
        options: &DownloadOptions,
    ) -> Result<ArtifactDownloadReport>;

    fn download(
        &self,
        artifacts: &[ArtifactRevisionId],
        options: &DownloadOptions,
    ) -> Result<DownloadReport>;

    fn exists(&self, artifact: &ArtifactRevisionId) -> Result<bool>;

    fn locate(&self, artifact: &ArtifactRevisionId) -> Result<Option<ArtifactOrigin>>;

    fn list_organisations(&self) -> Result<Vec<OrganisationEntry>> {
        Ok(Vec::new())
    }

    fn list_modules(&self, _organisation: &OrganisationEntry) -> Result<Vec<ModuleEntry>> {
        Ok(Vec::new())
    }

    fn list_revisions(&self, _module: &ModuleEntry) -> Result<Vec<RevisionEntry>> {
        Ok(Vec::new())
    }

    /// Values `token` takes given the values already fixed in `other_tokens`.
    fn list_token_values(
        &self,
        _token: &str,
        _other_tokens: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Every combination of values of `tokens` matching `criteria`.
    fn list_token_value_combinations(
        &self,
        _tokens: &[&str],
        _criteria: &BTreeMap<String, String>,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        Ok(Vec::new())
    }
}
