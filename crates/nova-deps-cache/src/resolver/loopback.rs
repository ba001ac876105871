use super::{
    ArtifactDownloadReport, ArtifactOrigin, DependencyDescriptor, DependencyResolver,
    DownloadOptions, DownloadReport, ModuleEntry, OrganisationEntry, ResolveData,
    ResolvedModuleRevision, ResolvedResource, ResolverSettings, RevisionEntry,
};
use crate::coordinates::ArtifactRevisionId;
use crate::error::{DepsCacheError, Result};
use nova_cache::CacheLockingManager;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entry point for resolvers calling back into dependency resolution.
///
/// Every call runs the delegate inside [`CacheLockingManager::use_cache`], so
/// work triggered from inside a resolver sees (and updates) the shared cache
/// atomically. This resolver is a callback point, not a searchable
/// repository: listing operations fail with
/// [`DepsCacheError::UnsupportedOperation`].
pub struct LoopbackResolver {
    name: String,
    resolver: Arc<dyn DependencyResolver>,
    locking: Arc<CacheLockingManager>,
}

impl LoopbackResolver {
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<dyn DependencyResolver>,
        locking: Arc<CacheLockingManager>,
    ) -> Self {
        Self {
            name: name.into(),
            resolver,
            locking,
        }
    }

    pub fn delegate(&self) -> &Arc<dyn DependencyResolver> {
        &self.resolver
    }
}

impl DependencyResolver for LoopbackResolver {
    fn name(&self) -> &str {
        &self.name
    }

    /// Ignored; the loopback resolver keeps its own identity and lock policy.
    fn set_settings(&self, _settings: &ResolverSettings) {}

    fn get_dependency(
        &self,
        dependency: &DependencyDescriptor,
        data: &ResolveData,
    ) -> Result<Option<ResolvedModuleRevision>> {
        self.locking.use_cache(&format!("Resolve {dependency}"), || {
            self.resolver.get_dependency(dependency, data)
        })
    }

    fn find_ivy_file_ref(
        &self,
        dependency: &DependencyDescriptor,
        data: &ResolveData,
    ) -> Result<Option<ResolvedResource>> {
        self.locking
            .use_cache(&format!("Locate ivy file for {dependency}"), || {
                self.resolver.find_ivy_file_ref(dependency, data)
            })
    }

    fn download_artifact(
        &self,
        origin: &ArtifactOrigin,
        options: &DownloadOptions,
    ) -> Result<ArtifactDownloadReport> {
        self.locking.use_cache(&format!("Download {origin}"), || {
            self.resolver.download_artifact(origin, options)
        })
    }

    fn download(
        &self,
        artifacts: &[ArtifactRevisionId],
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        let names: Vec<String> = artifacts.iter().map(ToString::to_string).collect();
        let description = format!("Download [{}]", names.join(", "));
        self.locking.use_cache(&description, || {
            self.resolver.download(artifacts, options)
        })
    }

    fn exists(&self, artifact: &ArtifactRevisionId) -> Result<bool> {
        self.locking.use_cache(&format!("Locate {artifact}"), || {
            self.resolver.exists(artifact)
        })
    }

    fn locate(&self, artifact: &ArtifactRevisionId) -> Result<Option<ArtifactOrigin>> {
        self.locking.use_cache(&format!("Locate {artifact}"), || {
            self.resolver.locate(artifact)
        })
    }

    fn list_organisations(&self) -> Result<Vec<OrganisationEntry>> {
        Err(DepsCacheError::unsupported("list_organisations"))
    }

    fn list_modules(&self, _organisation: &OrganisationEntry) -> Result<Vec<ModuleEntry>> {
        Err(DepsCacheError::unsupported("list_modules"))
    }

    fn list_revisions(&self, _module: &ModuleEntry) -> Result<Vec<RevisionEntry>> {
        Err(DepsCacheError::unsupported("list_revisions"))
    }

    fn list_token_values(
        &self,
        _token: &str,
        _other_tokens: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        Err(DepsCacheError::unsupported("list_token_values"))
    }

    fn list_token_value_combinations(
        &self,
        _tokens: &[&str],
        _criteria: &BTreeMap<String, String>,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        Err(DepsCacheError::unsupported("list_token_value_combinations"))
    }
}
