//! Error types shared by every subsystem in this crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Semantic error kinds. Variants map directly onto the kinds callers are
/// expected to branch on (circuit breaker recording, retry policy,
/// connection-status reporting) rather than onto specific failing crates.
#[derive(Error, Debug)]
pub enum Error {
    #[error("network error: {message}{}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Network {
        message: String,
        status: Option<u16>,
    },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("persistence error: {message}")]
    Persistence { message: String },

    #[error("circuit open for op_key={op_key}")]
    CircuitOpen { op_key: String },

    #[error("operation cancelled: {message}")]
    Cancelled { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network { message: message.into(), status: None }
    }

    pub fn network_status(message: impl Into<String>, status: u16) -> Self {
        Error::Network { message: message.into(), status: Some(status) }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout { message: message.into() }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Error::Persistence { message: message.into() }
    }

    pub fn circuit_open(op_key: impl Into<String>) -> Self {
        Error::CircuitOpen { op_key: op_key.into() }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Cancelled { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal { message: message.into() }
    }

    /// Whether the circuit breaker / retry policy should treat this as a
    /// failure worth counting. `CircuitOpen` and `Cancelled` are excluded:
    /// the former is the breaker speaking for itself, the latter is a
    /// deliberate stop, not a fault.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::CircuitOpen { .. } | Error::Cancelled { .. })
    }

    /// Short, stable label used in logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Network { .. } => "network",
            Error::Timeout { .. } => "timeout",
            Error::Serialization { .. } => "serialization",
            Error::Validation { .. } => "validation",
            Error::Persistence { .. } => "persistence",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Cancelled { .. } => "cancelled",
            Error::Internal { .. } => "internal",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Network { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence { message: err.to_string() }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout { message: err.to_string() }
        } else {
            Error::Network { message: err.to_string(), status: err.status().map(|s| s.as_u16()) }
        }
    }
}

// Manual Clone: reqwest/serde_json errors aren't Clone, so cloning an
// Error preserves category and message but not the original cause chain.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Network { message, status } => {
                Error::Network { message: message.clone(), status: *status }
            }
            Error::Timeout { message } => Error::Timeout { message: message.clone() },
            Error::Serialization { message } => Error::Serialization { message: message.clone() },
            Error::Validation { message } => Error::Validation { message: message.clone() },
            Error::Persistence { message } => Error::Persistence { message: message.clone() },
            Error::CircuitOpen { op_key } => Error::CircuitOpen { op_key: op_key.clone() },
            Error::Cancelled { message } => Error::Cancelled { message: message.clone() },
            Error::Internal { message } => Error::Internal { message: message.clone() },
        }
    }
}
