//! Storage error taxonomy
//!
//! Errors are classified into the three classes the handler treats
//! differently: lost connections trigger a reconnect, deadlocks a short
//! backoff, and anything else only consumes a retry.

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Connection to the store is lost or could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Transaction was aborted by deadlock detection
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// Statement failed for any other reason
    #[error("statement failed ({}): {message}", code.as_deref().unwrap_or("-"))]
    Statement {
        code: Option<String>,
        message: String,
    },
}

impl StorageError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn deadlock(msg: impl Into<String>) -> Self {
        Self::Deadlock(msg.into())
    }

    pub fn statement(msg: impl Into<String>) -> Self {
        Self::Statement {
            code: None,
            message: msg.into(),
        }
    }

    /// Classify a raw error message the way the store reports it
    pub fn from_message(code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        if code.as_deref() == Some("40P01") || message.contains("deadlock") {
            Self::Deadlock(message)
        } else if message.contains("connection") || message.contains("Broken pipe") {
            Self::Connection(message)
        } else {
            Self::Statement { code, message }
        }
    }

    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock(_))
    }

    /// SQLSTATE code, when the store reported one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Statement { code, .. } => code.as_deref(),
            Self::Deadlock(_) => Some("40P01"),
            Self::Connection(_) => None,
        }
    }
}
