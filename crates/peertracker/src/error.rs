//! Error types for peer attestation.

use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessLookupError;

/// Errors that can occur while attesting a local peer.
#[derive(Debug, Error)]
pub enum PeerTrackerError {
    /// The transport has no per-connection peer credential mechanism
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    /// The process behind the credentials is not the one that connected
    #[error("Attestation mismatch for pid {pid}: {reason}")]
    AttestationMismatch { pid: i32, reason: String },

    /// The process table query did not complete within the bounded wait
    #[error("Peer resolution timed out after {0:?}")]
    ResolutionTimeout(Duration),

    /// The attested process exited or was replaced
    #[error("Process {pid} is no longer attested")]
    ProcessExited { pid: i32 },

    /// Process table could not be read
    #[error("Process table lookup failed: {0}")]
    ProcessLookup(#[from] ProcessLookupError),

    /// Invalid tracker configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerTrackerError {
    /// Per-connection security failures; never retried.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            PeerTrackerError::AttestationMismatch { .. } | PeerTrackerError::ProcessExited { .. }
        )
    }

    /// Failures where accepting a new connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeerTrackerError::Io(_)
                | PeerTrackerError::ProcessLookup(_)
                | PeerTrackerError::ResolutionTimeout(_)
        )
    }
}

/// Result type for peer attestation.
pub type Result<T> = std::result::Result<T, PeerTrackerError>;
