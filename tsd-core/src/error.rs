//! Error types for the resolution engine
//!
//! Hard failures only. Soft outcomes (invalid headers, unresolved references,
//! revision conflicts, install conflicts) are carried as data in the results
//! of the operations that produce them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Engine errors
///
/// `Clone` so a single coalesced fetch outcome can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum TsdError {
    /// Transport level failure (connect, TLS, reading the body)
    #[error("Network error while requesting {url}: {message}")]
    Network { url: String, message: String },

    /// Request exceeded the configured timeout
    #[error("Request timed out after {timeout:?}: {url}")]
    NetworkTimeout { url: String, timeout: Duration },

    /// Upstream answered with a status we cannot use
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Local quota tracker says the upstream will refuse us until reset
    #[error("GitHub rate limit reached, resets in {}", format_reset(.reset_in))]
    RateLimitBlocked { reset_in: Duration },

    /// Offline mode and nothing stored for this request
    #[error("Not in cache (offline mode): {url}")]
    CacheMiss { url: String },

    /// Stored body failed checksum verification even after a forced refetch
    #[error("Cache entry is corrupt for {url}\nExpected checksum: {expected}\nActual checksum:   {actual}")]
    CacheCorruption {
        url: String,
        expected: String,
        actual: String,
    },

    /// No definition registered under this path
    #[error("Definition not found: {path}")]
    NotFound { path: String },

    /// Revision identifier is unknown for this definition
    #[error("Unknown revision {commit} for {path}")]
    UnknownRevision { path: String, commit: String },

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Invalid JSON in {what}: {message}")]
    Json { what: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Run was cancelled between file operations
    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TsdError>;

impl TsdError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TsdError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn json(what: impl Into<String>, err: serde_json::Error) -> Self {
        TsdError::Json {
            what: what.into(),
            message: err.to_string(),
        }
    }

    /// Whether a caller-level retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TsdError::Network { .. } | TsdError::NetworkTimeout { .. } => true,
            TsdError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn format_reset(reset_in: &Duration) -> String {
    let secs = reset_in.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
