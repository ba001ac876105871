use super::listener::{TransferListener, TransferListeners};
use super::{
    with_trailing_slash, CacheManagerAware, PasswordCredentials, RepositoryTransport,
    ResourceCollection, ResourceInfo, TransferOutcome,
};
use crate::coordinates::ArtifactRevisionId;
use crate::error::{sanitize_url, DepsCacheError, Result};
use crate::external_cache::{CachedArtifact, ExternalArtifactCache};
use base64::Engine;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use url::Url;

/// Settings for talking to an HTTP repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub credentials: Option<PasswordCredentials>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            credentials: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl HttpSettings {
    pub fn with_credentials(credentials: Option<PasswordCredentials>) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }
}

const CHECKSUM_SUFFIX: &str = ".sha256";

/// Fetches repository resources over HTTP(S).
///
/// Before downloading an artifact the collection asks the external artifact
/// cache for local candidates. When there are any, the repository's `.sha256`
/// checksum is fetched and a matching candidate is copied instead of
/// downloading the artifact again.
pub struct HttpResourceCollection {
    name: String,
    agent: ureq::Agent,
    authorization: Option<String>,
    external_cache: Arc<dyn ExternalArtifactCache>,
    listeners: TransferListeners,
}

impl HttpResourceCollection {
    pub fn new(
        name: impl Into<String>,
        settings: &HttpSettings,
        external_cache: Arc<dyn ExternalArtifactCache>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(settings.read_timeout)
            .build();
        let authorization = settings.credentials.as_ref().map(|credentials| {
            let raw = format!("{}:{}", credentials.username, credentials.password);
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw)
            )
        });
        Self {
            name: name.into(),
            agent,
            authorization,
            external_cache,
            listeners: TransferListeners::default(),
        }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let request = self.agent.request(method, url);
        match &self.authorization {
            Some(value) => request.set("Authorization", value),
            None => request,
        }
    }

    /// Sends the request, mapping 404 to `None`.
    fn call(&self, method: &str, url: &str) -> Result<Option<ureq::Response>> {
        match self.request(method, url).call() {
            Ok(response) => Ok(Some(response)),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, _)) => Err(DepsCacheError::Http {
                message: format!("server returned status {code} for {}", sanitize_url(url)),
            }),
            Err(ureq::Error::Transport(transport)) => Err(DepsCacheError::Http {
                message: format!("transport error for {}: {transport}", sanitize_url(url)),
            }),
        }
    }

    fn content_length(response: &ureq::Response) -> Option<u64> {
        response
            .header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    fn published_sha256(&self, source: &str) -> Result<Option<String>> {
        let Some(response) = self.call("GET", &format!("{source}{CHECKSUM_SUFFIX}"))? else {
            return Ok(None);
        };
        let body = response.into_string()?;
        Ok(body
            .split_whitespace()
            .next()
            .map(str::to_ascii_lowercase))
    }

    fn reuse_local_candidate(
        &self,
        source: &str,
        artifact: Option<&ArtifactRevisionId>,
        destination: &Path,
    ) -> Result<Option<TransferOutcome>> {
        let mut candidates: Vec<CachedArtifact> = Vec::new();
        self.external_cache
            .add_matching_cached_artifacts(artifact, &mut candidates)?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let Some(expected) = self.published_sha256(source)? else {
            return Ok(None);
        };

        for candidate in candidates {
            let actual = match candidate.sha256() {
                Ok(actual) => actual,
                Err(err) => {
                    tracing::debug!(
                        target = "nova.deps",
                        file = %candidate.file().display(),
                        error = %err,
                        "skipping unreadable local candidate"
                    );
                    continue;
                }
            };
            if actual != expected {
                continue;
            }

            tracing::debug!(
                target = "nova.deps",
                resource = %sanitize_url(source),
                file = %candidate.file().display(),
                "reusing local artifact with matching checksum"
            );
            nova_cache::atomic_write_with(destination, |out| {
                io::copy(&mut File::open(candidate.file())?, out)?;
                Ok::<_, DepsCacheError>(())
            })?;
            return Ok(Some(TransferOutcome::ReusedLocal {
                from: candidate.file().to_path_buf(),
            }));
        }
        Ok(None)
    }
}

impl fmt::Debug for HttpResourceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResourceCollection")
            .field("name", &self.name)
            .field("authenticated", &self.authorization.is_some())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl ResourceCollection for HttpResourceCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_resource(&self, source: &str) -> Result<Option<ResourceInfo>> {
        Ok(self.call("HEAD", source)?.map(|response| ResourceInfo {
            name: source.to_owned(),
            content_length: Self::content_length(&response),
        }))
    }

    fn get(
        &self,
        source: &str,
        artifact: Option<&ArtifactRevisionId>,
        destination: &Path,
    ) -> Result<Option<TransferOutcome>> {
        // Reuse is best effort: an unreachable checksum or unreadable candidate
        // means the artifact is fetched normally.
        match self.reuse_local_candidate(source, artifact, destination) {
            Ok(Some(outcome)) => return Ok(Some(outcome)),
            Ok(None) => {}
            Err(err) => tracing::debug!(
                target = "nova.deps",
                resource = %sanitize_url(source),
                error = %err,
                "local candidate lookup failed; downloading"
            ),
        }

        let resource = sanitize_url(source);
        self.listeners.initiated(&resource);
        let response = match self.call("GET", source) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.listeners.failed(&resource, None, 0, &err);
                return Err(err);
            }
        };

        let total_length = Self::content_length(&response);
        let mut bytes = 0;
        nova_cache::atomic_write_with(destination, |out| {
            let mut reader = response.into_reader();
            bytes = self
                .listeners
                .copy_with_progress(&resource, total_length, &mut reader, out)?;
            Ok::<_, DepsCacheError>(())
        })?;
        Ok(Some(TransferOutcome::Downloaded { bytes }))
    }

    fn add_transfer_listener(&self, listener: Arc<dyn TransferListener>) {
        self.listeners.add(listener);
    }

    fn remove_transfer_listener(&self, listener: &Arc<dyn TransferListener>) {
        self.listeners.remove(listener);
    }

    fn has_transfer_listener(&self, listener: &Arc<dyn TransferListener>) -> bool {
        self.listeners.contains(listener)
    }
}

/// Transport for `http:`/`https:` repositories.
pub struct HttpTransport {
    name: String,
    settings: HttpSettings,
    external_cache: Arc<dyn ExternalArtifactCache>,
    accessor: OnceLock<Arc<HttpResourceCollection>>,
}

impl HttpTransport {
    pub fn new(
        name: impl Into<String>,
        settings: HttpSettings,
        external_cache: Arc<dyn ExternalArtifactCache>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            external_cache,
            accessor: OnceLock::new(),
        }
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RepositoryTransport for HttpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn repository_accessor(&self) -> Result<Arc<dyn ResourceCollection>> {
        let accessor = self.accessor.get_or_init(|| {
            Arc::new(HttpResourceCollection::new(
                self.name.clone(),
                &self.settings,
                self.external_cache.clone(),
            ))
        });
        Ok(accessor.clone())
    }

    /// Downloads go through the shared cache manager; nothing to configure.
    fn configure_cache_manager(&self, _resolver: &mut dyn CacheManagerAware) {}

    fn convert_to_path(&self, uri: &Url) -> Result<String> {
        Ok(with_trailing_slash(uri.as_str().to_owned()))
    }
}
