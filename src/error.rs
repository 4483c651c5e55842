//! WolfHA Error Types

use thiserror::Error;

use crate::state::BackendState;
use crate::sync::SyncStep;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // Cluster execution errors
    #[error("Backend {backend} failed: {message}")]
    BackendExecution { backend: String, message: String },

    #[error("Backend {backend} timed out")]
    BackendTimeout { backend: String },

    #[error("All backends failed: {cause}")]
    ClusterExhausted { cause: Box<Error> },

    #[error("No active backend available")]
    NoActiveBackend,

    // Topology errors
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend {0} is the last active backend")]
    LastActiveBackend(String),

    #[error("Invalid state transition for {backend}: {from} -> {to}")]
    InvalidTransition {
        backend: String,
        from: BackendState,
        to: BackendState,
    },

    // Synchronization errors
    #[error("Synchronization of {backend} failed at step {step}: {cause}")]
    Synchronization {
        step: SyncStep,
        backend: String,
        cause: Box<Error>,
    },

    // Lock errors
    #[error("Timed out acquiring lock {lock}")]
    LockTimeout { lock: String },

    #[error("Lock protocol error: {0}")]
    LockProtocol(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State store error: {0}")]
    StateStore(#[from] rusqlite::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::Network(_)
                | Error::LockTimeout { .. }
                | Error::NoActiveBackend
        )
    }

    /// Check if this error means a backend should leave the active set
    pub fn isolates_backend(&self) -> bool {
        matches!(
            self,
            Error::BackendExecution { .. } | Error::BackendTimeout { .. }
        )
    }

    /// Wrap a per-backend failure with the backend's name
    pub fn on_backend(self, backend: &str) -> Error {
        match self {
            Error::BackendExecution { .. } | Error::BackendTimeout { .. } => self,
            other => Error::BackendExecution {
                backend: backend.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// The error as a client of the logical database should see it.
    ///
    /// Clients never learn which or how many backends exist, so backend
    /// names are stripped and cluster-level wrappers are flattened.
    pub fn client_view(self) -> Error {
        match self {
            Error::BackendExecution { message, .. } => Error::QueryExecution(message),
            Error::BackendTimeout { .. } => {
                Error::QueryExecution("statement timed out".to_string())
            }
            Error::ClusterExhausted { cause } => Error::ClusterExhausted {
                cause: Box::new(cause.client_view()),
            },
            Error::LastActiveBackend(_) | Error::NoActiveBackend => Error::NoActiveBackend,
            other => other,
        }
    }
}
