//! Error types for the tether broker.
//!
//! Every fallible operation in the crate returns [`TetherError`]. Errors that
//! cross the link are flattened into a [`Status`] on the serving side and
//! rebuilt as [`TetherError::Remote`] on the calling side.

use crate::resource::ResourceId;
use crate::transport::frame::{Code, Status};
use thiserror::Error;

/// Main error type for the tether library.
#[derive(Debug, Error)]
pub enum TetherError {
    // Broker errors
    #[error("Resource {id} not found on this broker")]
    ResourceNotFound { id: ResourceId },

    #[error("Failed to allocate endpoint {name}: {message}")]
    AllocationFailed { name: String, message: String },

    #[error("Resource {name} is closed")]
    ResourceClosed { name: String },

    #[error("Capability {capability} cannot create resources without a broker")]
    NoBroker { capability: String },

    // Link errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    /// An error status returned by the peer, passed through verbatim.
    #[error("Remote error ({code}): {message}")]
    Remote { code: Code, message: String },

    // Dispatch errors
    #[error("Method {method} not found on {capability}")]
    MethodNotFound { capability: String, method: String },

    #[error("Invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },

    // Teardown errors
    #[error("{} error(s) while closing: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<TetherError>),

    // IO and serialization errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Plugin process error: {message}")]
    Plugin { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

fn join_messages(errors: &[TetherError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TetherError {
    /// Build an error from a status received over the link.
    pub fn from_status(status: Status) -> Self {
        TetherError::Remote {
            code: status.code,
            message: status.message,
        }
    }

    /// Convert to a wire status code.
    ///
    /// Remote errors keep the code they arrived with so that a failure deep in
    /// a chain of plugins reaches the original caller unchanged. Failures of
    /// the wrapped implementation itself map to `unknown`, never to
    /// `internal`, so they are not mistaken for a close race.
    pub fn to_status_code(&self) -> Code {
        match self {
            TetherError::Remote { code, .. } => *code,

            TetherError::ResourceNotFound { .. } | TetherError::MethodNotFound { .. } => {
                Code::NotFound
            }

            TetherError::ResourceClosed { .. }
            | TetherError::ConnectionClosed
            | TetherError::Timeout(_) => Code::Unavailable,

            TetherError::InvalidParams { .. } | TetherError::Json { .. } => Code::InvalidArgument,

            TetherError::Protocol { .. } | TetherError::NoBroker { .. } => Code::Internal,

            // Everything else is an implementation failure
            _ => Code::Unknown,
        }
    }

    /// Flatten into the status sent back over the link.
    pub fn to_status(&self) -> Status {
        let message = match self {
            TetherError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Status::new(self.to_status_code(), message)
    }

    /// Whether this error, returned by a `close` call, means the peer already
    /// tore the resource down.
    ///
    /// The server stops the endpoint that carries the close acknowledgment as
    /// part of its own teardown, so the reply may be replaced by an
    /// `unavailable` or `internal` status, or the link may be gone entirely.
    pub fn is_close_race(&self) -> bool {
        matches!(
            self,
            TetherError::ConnectionClosed
                | TetherError::Remote {
                    code: Code::Unavailable | Code::Internal,
                    ..
                }
        )
    }

    /// Check if this error should be retried by the caller.
    ///
    /// Resolution failures are protocol-usage bugs and are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TetherError::Timeout(_)
                | TetherError::Remote {
                    code: Code::Unavailable,
                    ..
                }
        )
    }
}
