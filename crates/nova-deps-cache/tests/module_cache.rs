use nova_cache::{CacheLockingManager, LockOptions};
use nova_deps_cache::{
    ArtifactResolutionCache, ArtifactRevisionId, CachePolicy, CachedDescriptor, FixedTimeProvider,
    ModuleDescriptor, ModuleDescriptorCache, ModuleRevisionId, RepositoryId, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingExpiry {
    expired: Mutex<Vec<(RepositoryId, ArtifactRevisionId)>>,
}

impl RecordingExpiry {
    fn expired(&self) -> Vec<(RepositoryId, ArtifactRevisionId)> {
        self.expired.lock().clone()
    }
}

impl ArtifactResolutionCache for RecordingExpiry {
    fn expire_cached_artifact_resolution(
        &self,
        repository: &RepositoryId,
        artifact: &ArtifactRevisionId,
    ) -> Result<()> {
        self.expired
            .lock()
            .push((repository.clone(), artifact.clone()));
        Ok(())
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    cache: ModuleDescriptorCache,
    expiry: Arc<RecordingExpiry>,
    time: Arc<FixedTimeProvider>,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let locking = Arc::new(CacheLockingManager::new(tmp.path(), LockOptions::default()).unwrap());
    let expiry = Arc::new(RecordingExpiry::default());
    let time = Arc::new(FixedTimeProvider::new(1_000_000));
    let cache = ModuleDescriptorCache::new(locking, expiry.clone(), time.clone());
    Fixture {
        _tmp: tmp,
        cache,
        expiry,
        time,
    }
}

fn module_id() -> ModuleRevisionId {
    ModuleRevisionId::new("com.example", "lib", "1.0-SNAPSHOT")
}

fn jar(classifier: Option<&str>) -> ArtifactRevisionId {
    let artifact = ArtifactRevisionId::new(module_id(), "lib", "jar", "jar");
    match classifier {
        Some(classifier) => artifact.with_attribute("classifier", classifier),
        None => artifact,
    }
}

fn descriptor(published_at_millis: u64) -> ModuleDescriptor {
    ModuleDescriptor::new(module_id(), published_at_millis)
        .with_artifact(jar(None))
        .with_artifact(jar(Some("sources")))
        .with_artifact(jar(None))
}

#[test]
fn unknown_module_is_a_cache_miss() {
    let f = fixture();
    let lookup = f
        .cache
        .get_cached_module_descriptor(&RepositoryId::new("central"), &module_id())
        .unwrap();
    assert!(lookup.is_none());
}

#[test]
fn missing_module_round_trips_as_missing() {
    let f = fixture();
    let repo = RepositoryId::new("central");
    f.cache
        .cache_module_descriptor(&repo, &module_id(), None, false)
        .unwrap();

    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert!(cached.is_missing());
    assert!(!cached.is_changing_module());
    assert_eq!(cached.module_descriptor(), &CachedDescriptor::Missing);
    assert_eq!(cached.cached_at_millis(), 1_000_000);
    assert!(f.expiry.expired().is_empty());
}

#[test]
fn present_module_round_trips_with_flags() {
    let f = fixture();
    let repo = RepositoryId::new("central");
    let descriptor = descriptor(10);
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor), true)
        .unwrap();

    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert!(!cached.is_missing());
    assert!(cached.is_changing_module());
    assert_eq!(cached.module_descriptor().as_present(), Some(&descriptor));

    let other_repo = RepositoryId::new("snapshots");
    assert!(f
        .cache
        .get_cached_module_descriptor(&other_repo, &module_id())
        .unwrap()
        .is_none());
}

#[test]
fn republished_changing_module_expires_previous_artifacts_once() {
    let f = fixture();
    let repo = RepositoryId::new("snapshots");
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(10)), true)
        .unwrap();
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(20)), true)
        .unwrap();

    // Duplicate artifact declarations are expired once.
    assert_eq!(
        f.expiry.expired(),
        vec![
            (repo.clone(), jar(None)),
            (repo.clone(), jar(Some("sources")))
        ]
    );

    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert_eq!(
        cached
            .module_descriptor()
            .as_present()
            .map(|descriptor| descriptor.published_at_millis),
        Some(20)
    );
}

#[test]
fn unchanged_publication_time_expires_nothing() {
    let f = fixture();
    let repo = RepositoryId::new("snapshots");
    for _ in 0..3 {
        f.cache
            .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(10)), true)
            .unwrap();
    }
    assert!(f.expiry.expired().is_empty());
}

#[test]
fn previously_changing_module_expires_when_recorded_as_static() {
    let f = fixture();
    let repo = RepositoryId::new("snapshots");
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(10)), true)
        .unwrap();
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(11)), false)
        .unwrap();
    assert_eq!(f.expiry.expired().len(), 2);

    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert!(!cached.is_changing_module());
}

#[test]
fn static_module_rewrites_do_not_expire() {
    let f = fixture();
    let repo = RepositoryId::new("central");
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(10)), false)
        .unwrap();
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(11)), false)
        .unwrap();
    assert!(f.expiry.expired().is_empty());
}

#[test]
fn module_found_after_being_missing_expires_nothing() {
    let f = fixture();
    let repo = RepositoryId::new("snapshots");
    f.cache
        .cache_module_descriptor(&repo, &module_id(), None, true)
        .unwrap();
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(10)), true)
        .unwrap();

    assert!(f.expiry.expired().is_empty());
    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert!(!cached.is_missing());
}

#[test]
fn republish_is_detected_beside_a_similarly_named_repository() {
    let f = fixture();
    let spaced = RepositoryId::new("corp repo");
    let underscored = RepositoryId::new("corp_repo");
    f.cache
        .cache_module_descriptor(&spaced, &module_id(), Some(&descriptor(10)), true)
        .unwrap();
    f.cache
        .cache_module_descriptor(&underscored, &module_id(), Some(&descriptor(10)), true)
        .unwrap();

    f.cache
        .cache_module_descriptor(&spaced, &module_id(), Some(&descriptor(20)), true)
        .unwrap();
    let expired_repos: Vec<_> = f
        .expiry
        .expired()
        .into_iter()
        .map(|(repo, _)| repo)
        .collect();
    assert_eq!(expired_repos, vec![spaced.clone(), spaced.clone()]);
}

#[test]
fn missing_entry_replaces_stored_payload() {
    let f = fixture();
    let repo = RepositoryId::new("central");
    f.cache
        .cache_module_descriptor(&repo, &module_id(), Some(&descriptor(10)), false)
        .unwrap();
    let payload = f.cache.store().descriptor_path(&repo, &module_id());
    assert!(payload.is_file());

    f.cache
        .cache_module_descriptor(&repo, &module_id(), None, false)
        .unwrap();
    assert!(!payload.exists());
    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert!(cached.is_missing());
}

#[test]
fn age_and_refresh_follow_the_clock() {
    let f = fixture();
    let repo = RepositoryId::new("central");
    let policy = CachePolicy {
        missing_module_ttl: Duration::from_secs(60),
        ..CachePolicy::default()
    };
    f.cache
        .cache_module_descriptor(&repo, &module_id(), None, false)
        .unwrap();

    f.time.advance(59_000);
    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert_eq!(cached.age(), Duration::from_secs(59));
    assert!(!cached.must_refresh(&policy));

    f.time.advance(1_000);
    let cached = f
        .cache
        .get_cached_module_descriptor(&repo, &module_id())
        .unwrap()
        .unwrap();
    assert!(cached.must_refresh(&policy));
}
