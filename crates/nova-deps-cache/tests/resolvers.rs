use httpmock::prelude::*;
use httpmock::Method::HEAD;
use nova_cache::{CacheConfig, CacheError, CacheLockingManager, LockMode, LockOptions};
use nova_deps_cache::resolver::{
    ArtifactDownloadReport, ArtifactOrigin, ArtifactToFileResolver, ArtifactToFileResolverChain,
    DependencyDescriptor, DependencyResolver, DownloadOptions, DownloadReport, DownloadStatus,
    DownloadingArtifactResolver, ModuleDescriptorParser, OrganisationEntry, ResolveData,
    ResolvedModuleRevision, ResolvedResource,
};
use nova_deps_cache::transport::RepositoryCacheManager;
use nova_deps_cache::{
    ArtifactRevisionId, DepsCacheError, ModuleDescriptor, ModuleRevisionId, ResolutionCache,
    Result,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lib_id() -> ModuleRevisionId {
    ModuleRevisionId::new("com.example", "lib", "1.0")
}

fn lib_jar() -> ArtifactRevisionId {
    ArtifactRevisionId::new(lib_id(), "lib", "jar", "jar")
}

/// Descriptor files in these tests hold just the publication timestamp.
struct TimestampParser;

impl ModuleDescriptorParser for TimestampParser {
    fn parse(&self, id: &ModuleRevisionId, file: &Path) -> Result<ModuleDescriptor> {
        let published = fs::read_to_string(file)?.trim().parse().unwrap_or(0);
        Ok(ModuleDescriptor::new(id.clone(), published).with_artifact(ArtifactRevisionId::new(
            id.clone(),
            id.name.clone(),
            "jar",
            "jar",
        )))
    }
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Records the lock mode held while each call runs.
struct LockRecorder {
    locking: Arc<CacheLockingManager>,
    observed: Mutex<Vec<(&'static str, Option<LockMode>)>>,
}

impl LockRecorder {
    fn record(&self, call: &'static str) {
        self.observed
            .lock()
            .push((call, self.locking.access().held_mode()));
    }
}

impl DependencyResolver for LockRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn get_dependency(
        &self,
        _dependency: &DependencyDescriptor,
        _data: &ResolveData,
    ) -> Result<Option<ResolvedModuleRevision>> {
        self.record("get_dependency");
        Ok(None)
    }

    fn find_ivy_file_ref(
        &self,
        _dependency: &DependencyDescriptor,
        _data: &ResolveData,
    ) -> Result<Option<ResolvedResource>> {
        self.record("find_ivy_file_ref");
        Ok(None)
    }

    fn download_artifact(
        &self,
        origin: &ArtifactOrigin,
        _options: &DownloadOptions,
    ) -> Result<ArtifactDownloadReport> {
        self.record("download_artifact");
        Ok(ArtifactDownloadReport::no_file(origin.artifact.clone()))
    }

    fn download(
        &self,
        artifacts: &[ArtifactRevisionId],
        _options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        self.record("download");
        Ok(DownloadReport {
            artifacts: artifacts
                .iter()
                .cloned()
                .map(ArtifactDownloadReport::no_file)
                .collect(),
        })
    }

    fn exists(&self, _artifact: &ArtifactRevisionId) -> Result<bool> {
        self.record("exists");
        Ok(false)
    }

    fn locate(&self, _artifact: &ArtifactRevisionId) -> Result<Option<ArtifactOrigin>> {
        self.record("locate");
        Ok(None)
    }
}

#[test]
fn loopback_runs_every_call_under_the_cache_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = ResolutionCache::open_at(tmp.path(), LockOptions::default()).unwrap();
    let recorder = Arc::new(LockRecorder {
        locking: cache.locking().clone(),
        observed: Mutex::new(Vec::new()),
    });
    let loopback = cache.loopback_resolver("loopback", recorder.clone());
    assert_eq!(loopback.name(), "loopback");

    let dependency = DependencyDescriptor::new(lib_id());
    let data = ResolveData::default();
    let options = DownloadOptions::default();
    let origin = ArtifactOrigin {
        artifact: lib_jar(),
        location: "/repo/lib-1.0.jar".into(),
        is_local: true,
    };

    assert!(loopback.get_dependency(&dependency, &data).unwrap().is_none());
    assert!(loopback.find_ivy_file_ref(&dependency, &data).unwrap().is_none());
    assert_eq!(
        loopback.download_artifact(&origin, &options).unwrap().status,
        DownloadStatus::NoFile
    );
    assert_eq!(
        loopback.download(&[lib_jar()], &options).unwrap().artifacts.len(),
        1
    );
    assert!(!loopback.exists(&lib_jar()).unwrap());
    assert!(loopback.locate(&lib_jar()).unwrap().is_none());

    let observed = recorder.observed.lock().clone();
    assert_eq!(observed.len(), 6);
    for (call, mode) in observed {
        assert_eq!(mode, Some(LockMode::Exclusive), "{call} ran outside the lock");
    }
    assert_eq!(cache.locking().access().held_mode(), None);
}

#[test]
fn loopback_refuses_listing() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = ResolutionCache::open_at(tmp.path(), LockOptions::default()).unwrap();
    let recorder = Arc::new(LockRecorder {
        locking: cache.locking().clone(),
        observed: Mutex::new(Vec::new()),
    });
    let loopback = cache.loopback_resolver("loopback", recorder.clone());

    let organisation = OrganisationEntry {
        organisation: "com.example".into(),
    };
    let errors = [
        loopback.list_organisations().err(),
        loopback.list_modules(&organisation).err(),
        loopback.list_token_values("module", &BTreeMap::new()).err(),
        loopback
            .list_token_value_combinations(&["module"], &BTreeMap::new())
            .err(),
    ];
    for err in errors {
        assert!(err.unwrap().is_unsupported_operation());
    }
    assert!(recorder.observed.lock().is_empty());
}

#[test]
fn file_repository_resolves_in_place_and_caches_descriptors() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("repo");
    write(&repo.join("com/example/lib/1.0/lib-1.0.xml"), "1234");
    write(&repo.join("com/example/lib/1.0/lib-1.0.jar"), "jar");

    let cache = ResolutionCache::open_at(tmp.path().join("cache"), LockOptions::default()).unwrap();
    let url = Url::from_directory_path(&repo).unwrap();
    let resolver = cache
        .repository_resolver("local", url.as_str(), None, Arc::new(TimestampParser))
        .unwrap();
    assert!(matches!(
        resolver.cache_manager(),
        RepositoryCacheManager::LocalFile { .. }
    ));

    let dependency = DependencyDescriptor::new(lib_id());
    let resolved = resolver
        .get_dependency(&dependency, &ResolveData::default())
        .unwrap()
        .unwrap();
    assert_eq!(resolved.resolver, "local");
    assert_eq!(resolved.descriptor.published_at_millis, 1234);

    // Served from the descriptor cache from now on.
    fs::remove_file(repo.join("com/example/lib/1.0/lib-1.0.xml")).unwrap();
    let again = resolver
        .get_dependency(&dependency, &ResolveData::default())
        .unwrap()
        .unwrap();
    assert_eq!(again.descriptor, resolved.descriptor);

    let report = resolver
        .download(&[lib_jar()], &DownloadOptions::default())
        .unwrap();
    let report = report.report_for(&lib_jar()).unwrap();
    assert_eq!(report.status, DownloadStatus::Successful);
    assert_eq!(
        report.local_file.as_deref(),
        Some(repo.join("com/example/lib/1.0/lib-1.0.jar").as_path())
    );
}

#[test]
fn missing_module_is_remembered_until_refresh() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("repo");
    fs::create_dir_all(&repo).unwrap();

    let cache = ResolutionCache::open_at(tmp.path().join("cache"), LockOptions::default()).unwrap();
    let url = Url::from_directory_path(&repo).unwrap();
    let resolver = cache
        .repository_resolver("local", url.as_str(), None, Arc::new(TimestampParser))
        .unwrap();
    let dependency = DependencyDescriptor::new(lib_id());

    assert!(resolver
        .get_dependency(&dependency, &ResolveData::default())
        .unwrap()
        .is_none());
    let cached = cache
        .module_descriptor_cache()
        .get_cached_module_descriptor(resolver.repository_id(), &lib_id())
        .unwrap()
        .unwrap();
    assert!(cached.is_missing());

    write(&repo.join("com/example/lib/1.0/lib-1.0.xml"), "99");
    assert!(resolver
        .get_dependency(&dependency, &ResolveData::default())
        .unwrap()
        .is_none());

    let refreshed = resolver
        .get_dependency(&dependency, &ResolveData { refresh: true })
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.descriptor.published_at_millis, 99);
}

#[test]
fn http_repository_downloads_once_and_remembers_misses() {
    init_tracing();
    let server = MockServer::start();
    let jar_path = "/repo/com/example/lib/1.0/lib-1.0.jar";
    let sources_path = "/repo/com/example/lib/1.0/lib-1.0-sources.jar";
    let head = server.mock(|when, then| {
        when.method(HEAD).path(jar_path);
        then.status(200);
    });
    let get = server.mock(|when, then| {
        when.method(GET).path(jar_path);
        then.status(200).body("jar bytes");
    });
    let missing = server.mock(|when, then| {
        when.method(HEAD).path(sources_path);
        then.status(404);
    });

    let tmp = tempfile::tempdir().unwrap();
    let cache = ResolutionCache::open_at(tmp.path(), LockOptions::default()).unwrap();
    let resolver = cache
        .repository_resolver("central", &server.url("/repo"), None, Arc::new(TimestampParser))
        .unwrap();
    assert_eq!(resolver.cache_manager(), &RepositoryCacheManager::Shared);

    let sources = lib_jar().with_attribute("classifier", "sources");
    let options = DownloadOptions::default();

    let first = resolver.download(&[lib_jar(), sources.clone()], &options).unwrap();
    let jar = first.report_for(&lib_jar()).unwrap();
    assert_eq!(jar.status, DownloadStatus::Successful);
    let local = jar.local_file.clone().unwrap();
    let repo_dir = local
        .strip_prefix(cache.files_dir())
        .unwrap()
        .iter()
        .next()
        .unwrap();
    assert!(repo_dir.to_string_lossy().starts_with("central-"), "{repo_dir:?}");
    assert!(local.ends_with("com.example/lib/1.0/lib-1.0.jar"));
    assert_eq!(fs::read_to_string(&local).unwrap(), "jar bytes");
    assert_eq!(
        first.report_for(&sources).unwrap().status,
        DownloadStatus::NoFile
    );

    let second = resolver.download(&[lib_jar(), sources.clone()], &options).unwrap();
    assert_eq!(
        second.report_for(&lib_jar()).unwrap().status,
        DownloadStatus::Cached
    );
    assert_eq!(
        second.report_for(&sources).unwrap().status,
        DownloadStatus::NoFile
    );
    head.assert_hits(1);
    get.assert_hits(1);
    missing.assert_hits(1);

    let forced = resolver
        .download(&[lib_jar()], &DownloadOptions { force: true })
        .unwrap();
    assert_eq!(
        forced.report_for(&lib_jar()).unwrap().status,
        DownloadStatus::Successful
    );
    get.assert_hits(2);
}

#[test]
fn chain_prefers_project_output_then_downloads() {
    init_tracing();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(HEAD).path("/repo/com/example/lib/1.0/lib-1.0.jar");
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(GET).path("/repo/com/example/lib/1.0/lib-1.0.jar");
        then.status(200).body("jar bytes");
    });

    let tmp = tempfile::tempdir().unwrap();
    let cache = ResolutionCache::open_at(tmp.path(), LockOptions::default()).unwrap();
    let repository = Arc::new(
        cache
            .repository_resolver("central", &server.url("/repo"), None, Arc::new(TimestampParser))
            .unwrap(),
    );
    let loopback = Arc::new(cache.loopback_resolver("loopback", repository));

    let app = ArtifactRevisionId::new(
        ModuleRevisionId::new("com.example", "app", "1.0"),
        "app",
        "jar",
        "jar",
    );
    let app_output = tmp.path().join("build/libs/app.jar");
    let project = {
        let app = app.clone();
        let app_output = app_output.clone();
        move |artifact: &ArtifactRevisionId| -> Result<Option<PathBuf>> {
            Ok((artifact == &app).then(|| app_output.clone()))
        }
    };
    let chain = ArtifactToFileResolverChain::new(
        Arc::new(project),
        Arc::new(DownloadingArtifactResolver::new(loopback)),
    );

    assert_eq!(chain.resolve(&app).unwrap(), Some(app_output));
    let downloaded = chain.resolve(&lib_jar()).unwrap().unwrap();
    assert_eq!(fs::read_to_string(downloaded).unwrap(), "jar bytes");

    let unknown = ArtifactRevisionId::new(
        ModuleRevisionId::new("com.example", "absent", "1.0"),
        "absent",
        "jar",
        "jar",
    );
    assert_eq!(chain.resolve(&unknown).unwrap(), None);
}

#[test]
fn session_lays_out_under_the_cache_root_and_closes() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        cache_root_override: Some(tmp.path().to_path_buf()),
        ..CacheConfig::default()
    };
    let cache = ResolutionCache::open(&config).unwrap();
    assert!(cache.root().ends_with(ResolutionCache::DIR_NAME));
    assert_eq!(
        cache.files_dir(),
        cache.root().join(ResolutionCache::FILES_DIR_NAME)
    );

    let repo = nova_deps_cache::RepositoryId::new("central");
    cache
        .module_descriptor_cache()
        .cache_module_descriptor(&repo, &lib_id(), None, false)
        .unwrap();

    cache.close();
    let err = cache
        .module_descriptor_cache()
        .get_cached_module_descriptor(&repo, &lib_id())
        .unwrap_err();
    assert!(
        matches!(err, DepsCacheError::Cache(CacheError::LockClosed { .. })),
        "{err:?}"
    );
}
