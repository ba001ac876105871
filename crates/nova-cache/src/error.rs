use std::path::PathBuf;
use std::time::Duration;

use crate::lock::LockMode;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache locking and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("timed out after {timeout:?} waiting for {mode} lock on {path}")]
    LockTimeout {
        path: PathBuf,
        mode: LockMode,
        timeout: Duration,
    },

    /// A previous exclusive holder of the lock did not finish cleanly, so the
    /// contents guarded by the lock can't be trusted.
    #[error("{path} was not unlocked cleanly; its contents may be corrupt")]
    IntegrityViolation { path: PathBuf },

    #[error("lock on {path} has been closed")]
    LockClosed { path: PathBuf },

    /// Another process took the exclusive lock while this thread was converting
    /// its shared lock, so whatever it read under the shared lock is stale.
    #[error("{path} was modified by another writer during lock escalation")]
    EscalationConflict { path: PathBuf },
}

impl CacheError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }

    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, CacheError::IntegrityViolation { .. })
    }

    pub fn is_escalation_conflict(&self) -> bool {
        matches!(self, CacheError::EscalationConflict { .. })
    }
}
