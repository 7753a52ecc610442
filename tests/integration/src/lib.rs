//! Cross-crate integration tests for Trustbind
//!
//! This test suite validates:
//! - Node attestation handshakes driven end to end through configured attestors
//! - Rejection of credentials from untrusted authorities and replayed responses
//! - Attested Unix socket connections feeding JWT-SVID validation
//! - Wholesale key set refresh while validation is in flight

pub mod test_utils;

#[cfg(test)]
mod node_attestation_tests;

#[cfg(all(test, target_os = "linux"))]
mod workload_endpoint_tests;
