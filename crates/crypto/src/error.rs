//! Error types for proof-of-possession attestation.

use thiserror::Error;
use trustbind_core::CoreError;

/// Errors raised while proving or verifying possession of a private key.
#[derive(Debug, Error)]
pub enum PopError {
    /// Key or algorithm family the binding cannot verify
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Certificate key usage does not permit digital signatures
    #[error("Key usage not permitted: {0}")]
    KeyUsageNotPermitted(String),

    /// The challenge lacks the envelope required by the credential's key type
    #[error("Missing challenge: {0}")]
    MissingChallenge(&'static str),

    /// The response lacks the envelope required by the credential's key type
    #[error("Missing response: {0}")]
    MissingResponse(&'static str),

    #[error("Invalid {role} nonce length: expected {expected} bytes, got {actual}")]
    InvalidNonceLength {
        role: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Certificate was not signed by a configured trusted authority
    #[error("Untrusted certificate authority: {0}")]
    UntrustedAuthority(String),

    /// Certificate parsed but failed a policy check
    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    /// Undecodable attestation data, challenge or response
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Handshake step invoked out of order
    #[error("Handshake out of order: expected {expected}, in {actual}")]
    HandshakeState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The local private key could not produce a signature
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Random number generator failure
    #[error("Nonce generation failed: {0}")]
    Rng(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PopError {
    /// Setup-time failures; the component refuses to initialize.
    pub fn is_configuration(&self) -> bool {
        match self {
            PopError::Configuration(_) => true,
            PopError::Core(e) => e.is_configuration(),
            _ => false,
        }
    }

    /// Per-attempt rejections; never retried.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            PopError::UnsupportedKeyType(_)
                | PopError::KeyUsageNotPermitted(_)
                | PopError::MissingChallenge(_)
                | PopError::MissingResponse(_)
                | PopError::InvalidNonceLength { .. }
                | PopError::SignatureInvalid(_)
                | PopError::UntrustedAuthority(_)
                | PopError::CertificateRejected(_)
                | PopError::Malformed(_)
                | PopError::HandshakeState { .. }
        )
    }
}

/// Result type for proof-of-possession operations.
pub type Result<T> = std::result::Result<T, PopError>;
