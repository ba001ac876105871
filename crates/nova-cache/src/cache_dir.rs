use crate::error::CacheError;
use crate::lock::LockOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Lock acquisition timeout used when nothing else is configured.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for selecting the on-disk cache root and lock policy.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Override the global cache directory.
    pub cache_root_override: Option<PathBuf>,
    /// Upper bound on how long any cache lock acquisition may block.
    pub lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root_override: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl CacheConfig {
    /// Reads `NOVA_CACHE_DIR` and `NOVA_CACHE_LOCK_TIMEOUT_MS`.
    ///
    /// An unparsable timeout falls back to [`DEFAULT_LOCK_TIMEOUT`].
    pub fn from_env() -> Self {
        let lock_timeout = match std::env::var("NOVA_CACHE_LOCK_TIMEOUT_MS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(millis) => Duration::from_millis(millis),
                Err(err) => {
                    tracing::debug!(
                        target = "nova.cache",
                        value = %raw,
                        error = %err,
                        "ignoring invalid NOVA_CACHE_LOCK_TIMEOUT_MS"
                    );
                    DEFAULT_LOCK_TIMEOUT
                }
            },
            Err(_) => DEFAULT_LOCK_TIMEOUT,
        };

        Self {
            cache_root_override: std::env::var_os("NOVA_CACHE_DIR").map(PathBuf::from),
            lock_timeout,
        }
    }

    /// Resolves the cache root, creating it if needed.
    pub fn cache_root(&self) -> Result<PathBuf, CacheError> {
        let root = match &self.cache_root_override {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        };
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: self.lock_timeout,
            ..LockOptions::default()
        }
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".nova").join("cache"))
}
