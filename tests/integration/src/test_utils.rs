//! Test utilities for cross-crate integration tests

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::pkcs8::DecodePrivateKey;
use serde_json::{json, Value};
use signature::Signer;
use trustbind_core::SpiffeId;
use trustbind_crypto::{PopHandshake, Result};

pub const X509_RSA_CERT: &str = include_str!("../../../crates/crypto/testdata/rsa-cert.pem");
pub const X509_RSA_KEY: &str = include_str!("../../../crates/crypto/testdata/rsa-key.pem");
pub const X509_EC_CERT: &str = include_str!("../../../crates/crypto/testdata/ec-cert.pem");
pub const X509_EC_KEY: &str = include_str!("../../../crates/crypto/testdata/ec-key.pem");

pub const SSH_CA: &str = include_str!("../../../crates/crypto/testdata/ssh-ca.pub");
pub const SSH_ROGUE_CA: &str = include_str!("../../../crates/crypto/testdata/ssh-rogue-ca.pub");
pub const SSH_HOST_KEY: &str = include_str!("../../../crates/crypto/testdata/ssh-host");
pub const SSH_HOST_CERT: &str = include_str!("../../../crates/crypto/testdata/ssh-host-cert.pub");
pub const SSH_ROGUE_HOST_CERT: &str =
    include_str!("../../../crates/crypto/testdata/ssh-host-rogue-cert.pub");

pub const JWT_EC_KEY: &str = include_str!("../../../crates/identity/testdata/ec-key.pem");
pub const JWT_EC_PUB: &str = include_str!("../../../crates/identity/testdata/ec-pub.pem");

/// Initialize tracing only if not already initialized
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Run all three rounds of a server handshake against a client's
/// attestation data and challenge responder.
pub fn drive_handshake<H, F>(handshake: &mut H, attestation_data: &[u8], mut respond: F) -> Result<SpiffeId>
where
    H: PopHandshake,
    F: FnMut(&[u8]) -> Result<Vec<u8>>,
{
    handshake.verify_attestation_data(attestation_data)?;
    let challenge = handshake.issue_challenge()?;
    let response = respond(&challenge)?;
    handshake.verify_challenge_response(&response)?;
    handshake.agent_id()
}

/// Compact ES256 JWT signed with the identity crate's P-256 test key.
pub fn es256_token(kid: &str, claims: &Value) -> String {
    let key = p256::ecdsa::SigningKey::from_pkcs8_pem(JWT_EC_KEY).expect("test key");
    let header = json!({ "alg": "ES256", "kid": kid, "typ": "JWT" });
    let input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let signature: p256::ecdsa::Signature = key.sign(input.as_bytes());
    format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

/// Claims for a JWT-SVID valid for an hour.
pub fn svid_claims(subject: &str, audience: &[&str]) -> Value {
    let now = unix_now();
    json!({ "sub": subject, "aud": audience, "iat": now, "exp": now + 3600 })
}
