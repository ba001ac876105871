use std::time::Duration;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Freshness rules applied to cached resolution results.
///
/// Immutable, present modules never expire; changing modules and negative
/// (missing) results are re-resolved once they are older than their TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub changing_module_ttl: Duration,
    pub missing_module_ttl: Duration,
    pub missing_artifact_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            changing_module_ttl: DEFAULT_TTL,
            missing_module_ttl: DEFAULT_TTL,
            missing_artifact_ttl: DEFAULT_TTL,
        }
    }
}

impl CachePolicy {
    /// Policy that re-resolves anything changing or missing on every lookup.
    pub fn always_refresh() -> Self {
        Self {
            changing_module_ttl: Duration::ZERO,
            missing_module_ttl: Duration::ZERO,
            missing_artifact_ttl: Duration::ZERO,
        }
    }

    pub fn must_refresh_module(&self, is_missing: bool, is_changing: bool, age: Duration) -> bool {
        if is_missing {
            return age >= self.missing_module_ttl;
        }
        is_changing && age >= self.changing_module_ttl
    }

    pub fn must_refresh_missing_artifact(&self, age: Duration) -> bool {
        age >= self.missing_artifact_ttl
    }
}
