//! Challenge/response nonce primitives shared by every binding.
//!
//! Both sides mint an independent 32-byte nonce per attempt. The signed
//! message is always `SHA-256(challenge || response)`, challenge first.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{PopError, Result};

/// Length of every challenge and response nonce.
pub const NONCE_LEN: usize = 32;

/// Mint a fresh random nonce.
pub fn generate_nonce() -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| PopError::Rng(e.to_string()))?;
    Ok(nonce)
}

/// Digest signed by the prover. Nonce lengths are checked before hashing.
pub fn combine_nonces(challenge: &[u8], response: &[u8]) -> Result<[u8; 32]> {
    check_len("challenge", challenge)?;
    check_len("response", response)?;
    Ok(Sha256::new()
        .chain_update(challenge)
        .chain_update(response)
        .finalize()
        .into())
}

fn check_len(role: &'static str, nonce: &[u8]) -> Result<()> {
    if nonce.len() != NONCE_LEN {
        return Err(PopError::InvalidNonceLength {
            role,
            expected: NONCE_LEN,
            actual: nonce.len(),
        });
    }
    Ok(())
}
