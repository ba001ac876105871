//! Dependency-resolution caching for Nova's build integration.
//!
//! Resolving a JVM dependency graph means asking repositories for module
//! metadata and artifacts over and over. This crate keeps the answers, both
//! positive and negative, on disk under the shared cache root, and carries the
//! plumbing that fetches them in the first place:
//!
//! - [`ModuleDescriptorCache`]: (repository, module revision) to descriptor or
//!   "missing", expiring the artifacts of republished changing modules
//! - [`DefaultArtifactResolutionCache`]: (repository, artifact) to local file
//! - [`PatternBasedExternalArtifactCache`]: finds previously downloaded files by
//!   probing a directory laid out by an Ivy pattern
//! - [`transport`]: `file:` and HTTP(S) repository transports with transfer
//!   progress listeners
//! - [`resolver`]: the loopback resolver, the project-first resolver chain and a
//!   repository-backed resolver
//! - [`ResolutionCache`]: wires all of the above to one cache root
//!
//! All mutable state shares the lock scope of a
//! [`nova_cache::CacheLockingManager`], so several Nova processes may resolve
//! against the same cache root at once.

mod artifact_cache;
mod coordinates;
mod descriptor_store;
mod error;
mod external_cache;
mod module_cache;
pub mod pattern;
mod policy;
pub mod resolver;
mod session;
mod time;
pub mod transport;

pub use artifact_cache::{
    ArtifactResolutionCache, ArtifactResolutionKey, CachedArtifactResolution,
    DefaultArtifactResolutionCache,
};
pub use coordinates::{ArtifactRevisionId, ModuleDescriptor, ModuleRevisionId, RepositoryId};
pub use descriptor_store::{ModuleDescriptorStore, DESCRIPTOR_STORE_SCHEMA_VERSION};
pub use error::{DepsCacheError, Result};
pub use external_cache::{
    CachedArtifact, ExternalArtifactCache, FileTree, PatternBasedExternalArtifactCache,
    WalkDirFileTree,
};
pub use module_cache::{
    CachedDescriptor, CachedModuleDescriptor, ModuleDescriptorCache, ModuleDescriptorCacheEntry,
    RevisionKey,
};
pub use policy::CachePolicy;
pub use session::ResolutionCache;
pub use time::{FixedTimeProvider, SystemTimeProvider, TimeProvider};
