//! Core error types

use thiserror::Error;

/// Core error type for Trustbind
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted before the component was configured
    #[error("{0} is not configured")]
    Unconfigured(&'static str),

    /// Malformed trust domain name
    #[error("Invalid trust domain: {0}")]
    InvalidTrustDomain(String),

    /// Malformed SPIFFE ID
    #[error("Invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// Template rendering failed for the supplied data
    #[error("Template error: {0}")]
    Template(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this error belongs to the setup-time configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(self, CoreError::Config(_) | CoreError::Unconfigured(_))
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
