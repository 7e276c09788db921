//! Error types for the core library.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input, e.g. a message without sender or recipients.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested message does not exist or is not visible to the caller.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No backend accepts writes.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The operation has not been ported to the active backend yet.
    #[error("Not implemented on the active backend: {0}")]
    NotImplemented(&'static str),

    /// External send or fetch failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Relational backend failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Document backend failure.
    #[error("Document store error: {0}")]
    Document(#[from] redb::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Broad category of an [`Error`], safe to expose across the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Missing or invisible message.
    NotFound,
    /// Backend unreachable, read-only or failing.
    StorageUnavailable,
    /// Operation not ported to the active backend.
    NotImplemented,
    /// External transport failure.
    Transport,
    /// Deadline exceeded.
    Timeout,
    /// Bad configuration or credentials.
    Configuration,
}

impl ErrorKind {
    /// Human-readable category label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Validation => "Invalid request",
            Self::NotFound => "Mail not found",
            Self::StorageUnavailable => "Storage unavailable",
            Self::NotImplemented => "Not supported",
            Self::Transport => "Delivery failed",
            Self::Timeout => "Timed out",
            Self::Configuration => "Configuration error",
        }
    }
}

impl Error {
    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StorageUnavailable(_)
            | Self::Database(_)
            | Self::Document(_)
            | Self::Serde(_)
            | Self::Io(_) => ErrorKind::StorageUnavailable,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Message suitable for callers outside the core.
    ///
    /// Wrapped backend and library errors are reduced to their category so
    /// driver messages never leak.
    #[must_use]
    pub fn public_message(&self) -> String {
        let detail = match self {
            Self::Validation(d)
            | Self::NotFound(d)
            | Self::StorageUnavailable(d)
            | Self::Transport(d)
            | Self::Timeout(d)
            | Self::Config(d) => d.clone(),
            Self::NotImplemented(op) => format!("{op} is not available on the active backend"),
            Self::Database(_) | Self::Document(_) | Self::Serde(_) | Self::Io(_) => {
                "backend operation failed".to_string()
            }
        };
        format!("{}: {detail}", self.kind().label())
    }
}

macro_rules! document_error {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for Error {
                fn from(e: $source) -> Self {
                    Self::Document(e.into())
                }
            }
        )*
    };
}

document_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::StorageUnavailable(format!("background task failed: {e}"))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
