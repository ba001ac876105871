use nova_cache::CacheError;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, DepsCacheError>;

/// Errors produced by the dependency resolution cache and repository transports.
///
/// "Not found" outcomes (a module missing from a repository, a project resolver
/// with nothing to offer) are reported as `None`, never as an error.
#[derive(Debug, thiserror::Error)]
pub enum DepsCacheError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("{operation} is not supported by this resolver")]
    UnsupportedOperation { operation: &'static str },

    #[error("http request failed: {message}")]
    Http { message: String },

    #[error("unsupported repository url {url}")]
    UnsupportedUrl { url: String },

    #[error("invalid artifact pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid repository path {path:?}")]
    InvalidPath { path: PathBuf },
}

impl DepsCacheError {
    pub fn unsupported(operation: &'static str) -> Self {
        Self::UnsupportedOperation { operation }
    }

    pub fn is_unsupported_operation(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }
}

const URL_REDACTION: &str = "<redacted>";

/// Strips userinfo and query values from a URL before it goes into an error or
/// a log line. Repository URLs regularly carry credentials or signed tokens.
pub(crate) fn sanitize_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_owned();
    };
    let (scheme, rest) = url.split_at(scheme_end + 3);
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);

    let authority = match authority.rfind('@') {
        Some(at) => format!("{URL_REDACTION}@{}", &authority[at + 1..]),
        None => authority.to_owned(),
    };

    let tail = tail.split('#').next().unwrap_or_default();
    let tail = match tail.split_once('?') {
        Some((path, query)) => {
            let query: Vec<String> = query
                .split('&')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    let key = part.split_once('=').map_or(part, |(key, _)| key);
                    format!("{key}={URL_REDACTION}")
                })
                .collect();
            format!("{path}?{}", query.join("&"))
        }
        None => tail.to_owned(),
    };

    format!("{scheme}{authority}{tail}")
}
