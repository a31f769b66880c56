//! Error taxonomy shared by every subsystem.

use thiserror::Error;

/// Boxed source error carried by storage and transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Self-protection or an action the current state does not permit.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Clustering is disabled or no backing store was configured.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("storage {op} failed for {key}: {source}")]
    Storage {
        op: &'static str,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("transport error for host {host}: {message}")]
    Transport { host: String, message: String },

    /// Enrollment token expired, already used or unknown.
    #[error("token error: {0}")]
    Token(String),

    #[error("host {0} is not connected")]
    HostNotConnected(String),

    #[error("host {0} is paused")]
    HostPaused(String),

    /// Local container engine failure.
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn storage(op: &'static str, key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            op,
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn transport(host: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn cluster_disabled() -> Self {
        Self::ServiceUnavailable("clustering is disabled".into())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        Self::Runtime(e.to_string())
    }
}
