//! Repository transports: how bytes get from a repository into the cache.
//!
//! A [`RepositoryTransport`] describes one configured repository and hands out
//! a [`ResourceCollection`] accessor that performs the actual reads. The
//! [`RepositoryTransportFactory`] decorates every transport so the process-wide
//! progress listener is attached to its accessor exactly once.

mod factory;
mod file;
mod http;
mod listener;

pub use factory::{ListeningRepositoryTransport, RepositoryTransportFactory};
pub use file::{FileResourceCollection, FileTransport};
pub use http::{HttpResourceCollection, HttpSettings, HttpTransport};
pub use listener::{
    ProgressLoggingTransferListener, TransferEvent, TransferEventKind, TransferListener,
    TransferListeners,
};

use crate::coordinates::ArtifactRevisionId;
use crate::error::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Username/password pair for repositories that require authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordCredentials {
    pub username: String,
    pub password: String,
}

impl PasswordCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Metadata of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub name: String,
    pub content_length: Option<u64>,
}

/// How a [`ResourceCollection::get`] satisfied the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Downloaded { bytes: u64 },
    /// A local candidate with matching checksum was copied instead.
    ReusedLocal { from: PathBuf },
}

/// Accessor for the resources of one repository.
pub trait ResourceCollection: Send + Sync {
    fn name(&self) -> &str;

    /// Looks up `source`; `None` when the repository doesn't have it.
    fn get_resource(&self, source: &str) -> Result<Option<ResourceInfo>>;

    /// Fetches `source` into `destination`; `None` when the repository doesn't
    /// have it. `artifact` lets the accessor consider local candidates first.
    fn get(
        &self,
        source: &str,
        artifact: Option<&ArtifactRevisionId>,
        destination: &Path,
    ) -> Result<Option<TransferOutcome>>;

    /// Attaches `listener`; attaching one that is already present is a no-op.
    fn add_transfer_listener(&self, listener: Arc<dyn TransferListener>);

    fn remove_transfer_listener(&self, listener: &Arc<dyn TransferListener>);

    fn has_transfer_listener(&self, listener: &Arc<dyn TransferListener>) -> bool;
}

/// Where a resolver keeps the files it fetched through a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryCacheManager {
    /// The shared download cache under the cache root.
    Shared,
    /// Use files in place; the repository is already on the local disk.
    LocalFile { repository: String },
}

/// A resolver whose cache manager a transport may choose.
pub trait CacheManagerAware {
    fn set_repository_cache_manager(&mut self, manager: RepositoryCacheManager);
}

/// One configured repository.
pub trait RepositoryTransport: Send + Sync {
    fn name(&self) -> &str;

    /// The accessor for this repository. Built on first use and shared
    /// afterwards.
    fn repository_accessor(&self) -> Result<Arc<dyn ResourceCollection>>;

    fn configure_cache_manager(&self, resolver: &mut dyn CacheManagerAware);

    /// Normalises a repository URI into the root path used for pattern
    /// substitution. Always ends with `/`.
    fn convert_to_path(&self, uri: &Url) -> Result<String>;
}

pub(crate) fn with_trailing_slash(path: String) -> String {
    if path.ends_with('/') {
        path
    } else {
        path + "/"
    }
}
