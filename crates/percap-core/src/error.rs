//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// A counter name could not be parsed into a known form.
    #[error("Invalid counter '{name}': {reason}")]
    InvalidCounter { name: String, reason: String },

    /// A counter was configured twice with conflicting parameters.
    #[error("Counter '{name}' configured more than once")]
    DuplicateCounter { name: String },

    /// Session settings could not be decoded.
    #[error("Failed to parse session settings: {reason}")]
    SettingsParse { reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
