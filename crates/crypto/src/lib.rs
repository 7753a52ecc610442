//! Proof-of-possession node attestation for Trustbind.
//!
//! This crate proves that a node presenting a credential also holds the
//! matching private key. The verifier sends a fresh 32-byte challenge nonce,
//! the node answers with its own fresh nonce and a signature over
//! `SHA-256(challenge || response)`, and the verifier checks that signature
//! with the key from the credential it was originally shown.
//!
//! # Bindings
//!
//! - **X.509** ([`x509pop`]): RSA-PSS/SHA-256 for RSA keys, ECDSA for P-256,
//!   P-384 and P-521 keys; certificates must permit digital signatures
//! - **SSH** ([`sshpop`]): OpenSSH host certificates signed by a trusted
//!   certificate authority, matched by authority key fingerprint
//!
//! # Security Model
//!
//! - Nonces are exactly 32 bytes and never reused across attempts
//! - The verification key never comes from the response
//! - Any failure fails the whole attempt; failed handshakes cannot resume
//! - Nonces and signatures are never logged

pub mod attestor;
pub mod error;
pub mod nonce;
pub mod sshpop;
mod wire;
pub mod x509pop;

pub use attestor::{Attestor, PopHandshake, PopServer, SshPopAttestor, X509PopAttestor};
pub use error::{PopError, Result};
pub use nonce::{combine_nonces, generate_nonce, NONCE_LEN};
