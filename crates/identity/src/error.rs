//! Error types for JWT-SVID validation.

use thiserror::Error;
use trustbind_core::CoreError;

/// Reasons a JWT-SVID is refused.
///
/// Every variant except [`JwtSvidError::Key`] and configuration-class
/// [`JwtSvidError::Core`] errors is a per-token rejection.
#[derive(Debug, Error)]
pub enum JwtSvidError {
    /// Not a compact JWS with exactly one signature
    #[error("Unable to parse JWT token: {0}")]
    Malformed(String),

    #[error("Unsupported token signature algorithm: {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("Token header missing key id")]
    MissingKeyId,

    /// Subject claim absent or not a SPIFFE ID
    #[error("Token has malformed subject: {0}")]
    MalformedSubject(String),

    /// No key with this id under the subject's trust domain, including the
    /// case where the trust domain has no keys at all
    #[error("Public key {kid:?} not found in trust domain {trust_domain:?}")]
    KeyNotFound { trust_domain: String, kid: String },

    #[error("Unable to verify token signature: {0}")]
    SignatureInvalid(String),

    #[error("Token has expired")]
    Expired,

    /// `nbf` or `iat` lies in the future beyond the allowed leeway
    #[error("Token is not yet valid: {0}")]
    NotYetValid(String),

    #[error("Expected audience in {expected:?} (audience={actual:?})")]
    AudienceMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Registered claim present but of the wrong type, or `exp` missing
    #[error("Invalid token claims: {0}")]
    InvalidClaims(String),

    /// Public key material could not be loaded
    #[error("Invalid public key: {0}")]
    Key(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl JwtSvidError {
    pub fn is_configuration(&self) -> bool {
        match self {
            JwtSvidError::Key(_) => true,
            JwtSvidError::Core(e) => e.is_configuration(),
            _ => false,
        }
    }

    pub fn is_security_failure(&self) -> bool {
        !self.is_configuration()
    }
}

/// Result type for JWT-SVID operations.
pub type Result<T> = std::result::Result<T, JwtSvidError>;
