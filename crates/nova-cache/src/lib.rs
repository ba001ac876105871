//! Cross-process cache locking and small persistence building blocks.
//!
//! Nova's shared caches live under a single cache root (see [`CacheConfig`]) that
//! several processes, and several threads inside each process, may touch at the
//! same time. This crate provides the pieces that keep that root consistent:
//!
//! - [`LockedFileAccess`]: shared/exclusive locking of a file or directory with
//!   reentrancy, shared-to-exclusive escalation, bounded waits and clean/dirty
//!   integrity tracking
//! - [`CacheLockingManager`]: the lock scope of a cache root (`use_cache`) and a
//!   factory for indexes living inside it (`create_cache`)
//! - [`PersistentIndexedCache`]: a typed, bincode-encoded key/value file
//!
//! ## On-disk layout
//!
//! - `<file>.lock` next to a guarded file, or `<dir>/cache.lock` inside a guarded
//!   directory. The first byte records whether the last exclusive holder
//!   finished cleanly.
//! - index files written by [`PersistentIndexedCache`] (magic + schema version +
//!   entries), replaced atomically on every mutation.

mod cache_dir;
mod error;
mod indexed_cache;
mod lock;
mod locking;
mod util;

pub use cache_dir::{CacheConfig, DEFAULT_LOCK_TIMEOUT};
pub use error::{CacheError, Result};
pub use indexed_cache::{PersistentIndexedCache, INDEXED_CACHE_SCHEMA_VERSION};
pub use lock::{LockMode, LockOptions, LockedFileAccess, TargetKind, DIRECTORY_LOCK_FILE_NAME};
pub use locking::CacheLockingManager;
pub use util::{
    atomic_write, atomic_write_with, bincode_deserialize, bincode_serialize, now_millis,
    read_cache_file, remove_file_best_effort, BINCODE_PAYLOAD_LIMIT_BYTES,
};
