//! Host process table queries.
//!
//! Start times are expressed in clock ticks since boot, the unit the kernel
//! reports in `/proc/<pid>/stat`. The `(pid, start time)` pair identifies a
//! single process instance: a different start time for the same pid means
//! the pid was recycled.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Process start time in clock ticks since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StartTime(pub u64);

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ticks", self.0)
    }
}

/// Effective user and group of a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Process table lookup failures.
#[derive(Debug, Error)]
pub enum ProcessLookupError {
    #[error("process {0} not found")]
    NotFound(i32),

    #[error("failed to read process {pid}: {source}")]
    Io {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed process table entry for {pid}: {reason}")]
    Malformed { pid: i32, reason: String },
}

/// Read access to the host process table.
#[async_trait]
pub trait ProcessTable: Send + Sync + 'static {
    /// Start time of the process currently holding `pid`.
    async fn start_time(&self, pid: i32) -> Result<StartTime, ProcessLookupError>;

    /// Effective uid and gid of the process currently holding `pid`.
    async fn owner(&self, pid: i32) -> Result<ProcessOwner, ProcessLookupError>;

    /// Current boot-relative time in the same unit as [`StartTime`].
    fn now(&self) -> Result<StartTime, ProcessLookupError>;
}
