use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types surfaced by the memory subsystem
#[derive(Debug, Error)]
pub enum MemtuneError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Factory for class '{class}' failed: {message}")]
    FactoryFailed { class: String, message: String },

    #[error("Invalid snapshot index {index} (retained: {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("Class not registered: {class}")]
    UnknownClass { class: String },

    #[error("Connection configuration '{name}' not found")]
    UnknownConnection { name: String },

    #[error("Class '{class}' is not registered for type {expected}")]
    TypeMismatch { class: String, expected: &'static str },

    #[error("Advisory failure: {message}")]
    Advisory { message: String },
}

/// The three error families of the subsystem.
///
/// Configuration errors are fatal at construction, invalid references are
/// local and recoverable, advisory failures are only ever logged or recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InvalidReference,
    Advisory,
}

impl MemtuneError {
    pub fn configuration(message: impl Into<String>) -> Self {
        MemtuneError::Configuration { message: message.into() }
    }

    pub fn advisory(message: impl Into<String>) -> Self {
        MemtuneError::Advisory { message: message.into() }
    }

    /// Classify the error into its family
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemtuneError::Configuration { .. } | MemtuneError::FactoryFailed { .. } => {
                ErrorKind::Configuration
            }
            MemtuneError::InvalidIndex { .. }
            | MemtuneError::UnknownClass { .. }
            | MemtuneError::UnknownConnection { .. }
            | MemtuneError::TypeMismatch { .. } => ErrorKind::InvalidReference,
            MemtuneError::Advisory { .. } => ErrorKind::Advisory,
        }
    }

    /// Whether the caller can carry on with the same instance
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Configuration
    }
}

pub type Result<T> = std::result::Result<T, MemtuneError>;
