//! Core functionality for the Trustbind workload identity layer.
//!
//! This crate provides the fundamental types and utilities shared by the
//! peer tracker, the proof-of-possession engine and the JWT-SVID validator:
//! SPIFFE identifiers, agent path templates, configuration snapshots and
//! logging setup.

pub mod agent_path;
pub mod config;
pub mod error;
pub mod logging;
pub mod spiffe_id;
pub mod state;

pub use agent_path::{AgentPathTemplate, DEFAULT_AGENT_PATH_TEMPLATE};
pub use config::{LogFormat, LoggingConfig};
pub use error::{CoreError, Result};
pub use spiffe_id::{SpiffeId, TrustDomain};
pub use state::{ConfigCell, ConfigState};
