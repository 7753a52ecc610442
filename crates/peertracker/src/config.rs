//! Peer tracker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PeerTrackerError, Result};

/// Default bound on a single peer resolution (milliseconds).
pub const DEFAULT_RESOLUTION_TIMEOUT_MS: u64 = 5_000;

/// Default interval between liveness checks of a watched process (milliseconds).
pub const DEFAULT_LIVENESS_POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerTrackerConfig {
    /// Upper bound on credential extraction plus process table lookup
    pub resolution_timeout_ms: u64,
    /// How often each liveness monitor re-reads the process table
    pub liveness_poll_interval_ms: u64,
}

impl Default for PeerTrackerConfig {
    fn default() -> Self {
        Self {
            resolution_timeout_ms: DEFAULT_RESOLUTION_TIMEOUT_MS,
            liveness_poll_interval_ms: DEFAULT_LIVENESS_POLL_INTERVAL_MS,
        }
    }
}

impl PeerTrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resolution_timeout_ms == 0 {
            return Err(PeerTrackerError::Config(
                "resolution_timeout_ms must be positive".to_string(),
            ));
        }
        if self.liveness_poll_interval_ms == 0 {
            return Err(PeerTrackerError::Config(
                "liveness_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_timeout_ms)
    }

    pub fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_interval_ms)
    }
}
