use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while preparing or driving an upload
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No blob attached to transport")]
    NoBlob,

    #[error("Transport has been destroyed")]
    Destroyed,

    #[error("An upload attempt is already in flight")]
    AttemptInFlight,

    #[error("Transport is not bound to an execution runtime")]
    NotBound,

    #[error("Execution runtime not found: {id}")]
    RuntimeNotFound { id: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    #[error("Authorization handshake timed out")]
    AuthorizationTimeout,

    #[error("Execution runtime error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl TransportError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an authorization failure
    pub fn authorization<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    /// Create a runtime not found error
    pub fn runtime_not_found<S: Into<String>>(id: S) -> Self {
        Self::RuntimeNotFound { id: id.into() }
    }
}
