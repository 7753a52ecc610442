//! Attested local peers for the Trustbind agent.
//!
//! This crate binds Unix domain socket connections to the process instance
//! that opened them. A connection's peer credentials are captured from the
//! kernel at connect time and paired with the process start time, so a pid
//! recycled after the peer exits is detected instead of being mistaken for
//! the original caller.
//!
//! # Core Concepts
//!
//! - **Process Table**: start time lookups keyed by pid ([`ProcessTable`])
//! - **Process Tracker**: resolves connections to [`CallerInfo`] and keeps one
//!   liveness watch per attested process instance
//! - **Attested Listener**: a socket listener that only yields connections
//!   with an attested caller
//!
//! # Security Model
//!
//! - Credentials never come from address lookups, only from the connection
//! - A process that started after the connection was accepted is rejected
//! - Caller info becomes invalid as soon as the attested process exits
//! - TCP connections carry no credentials and are refused

pub mod config;
pub mod credentials;
pub mod error;
pub mod listener;
pub mod process;
#[cfg(target_os = "linux")]
pub mod procfs;
pub mod tracker;

pub use config::PeerTrackerConfig;
pub use credentials::{PeerAddr, PeerConnection, PeerCredentials};
pub use error::{PeerTrackerError, Result};
pub use listener::{AttestedListener, AttestedStream};
pub use process::{ProcessLookupError, ProcessOwner, ProcessTable, StartTime};
#[cfg(target_os = "linux")]
pub use procfs::ProcfsTable;
pub use tracker::{CallerInfo, ProcessTracker, WatchStatus};
