//! JWS signing algorithms and the public keys that verify them.

use std::fmt;
use std::str::FromStr;

use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use signature::Verifier;

use crate::error::{JwtSvidError, Result};

/// Asymmetric JWS algorithms a JWT-SVID may be signed with.
///
/// Symmetric (`HS*`) and `none` are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Rs256,
    Rs384,
    Rs512,
    Es256,
    Es384,
    Es512,
    Ps256,
    Ps384,
    Ps512,
}

impl Algorithm {
    pub const ALL: [Algorithm; 9] = [
        Algorithm::Rs256,
        Algorithm::Rs384,
        Algorithm::Rs512,
        Algorithm::Es256,
        Algorithm::Es384,
        Algorithm::Es512,
        Algorithm::Ps256,
        Algorithm::Ps384,
        Algorithm::Ps512,
    ];

    /// JOSE `alg` header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Rs256 => "RS256",
            Algorithm::Rs384 => "RS384",
            Algorithm::Rs512 => "RS512",
            Algorithm::Es256 => "ES256",
            Algorithm::Es384 => "ES384",
            Algorithm::Es512 => "ES512",
            Algorithm::Ps256 => "PS256",
            Algorithm::Ps384 => "PS384",
            Algorithm::Ps512 => "PS512",
        }
    }
}

impl FromStr for Algorithm {
    type Err = JwtSvidError;

    /// Exact, case-sensitive match against the allow-list.
    fn from_str(name: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == name)
            .ok_or_else(|| JwtSvidError::UnsupportedAlgorithm(name.to_string()))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public half of a JWT-SVID signing key.
pub enum JwtPublicKey {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::ecdsa::VerifyingKey),
}

impl JwtPublicKey {
    /// Decode a DER `SubjectPublicKeyInfo`.
    pub fn from_public_key_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
            return Ok(JwtPublicKey::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(JwtPublicKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(JwtPublicKey::P384(key));
        }
        if let Ok(key) = p521::PublicKey::from_public_key_der(der) {
            return p521_from_public_key(&key);
        }
        Err(JwtSvidError::Key(
            "expected an RSA, P-256, P-384 or P-521 public key".to_string(),
        ))
    }

    /// Decode a PEM `PUBLIC KEY` block.
    pub fn from_public_key_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(JwtPublicKey::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(JwtPublicKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(JwtPublicKey::P384(key));
        }
        if let Ok(key) = p521::PublicKey::from_public_key_pem(pem) {
            return p521_from_public_key(&key);
        }
        Err(JwtSvidError::Key(
            "expected a PEM encoded RSA, P-256, P-384 or P-521 public key".to_string(),
        ))
    }

    pub fn key_type(&self) -> &'static str {
        match self {
            JwtPublicKey::Rsa(_) => "RSA",
            JwtPublicKey::P256(_) => "EC P-256",
            JwtPublicKey::P384(_) => "EC P-384",
            JwtPublicKey::P521(_) => "EC P-521",
        }
    }

    /// Whether `alg` may be verified with this key. ECDSA keys are bound to
    /// the one algorithm matching their curve.
    pub fn supports(&self, alg: Algorithm) -> bool {
        use Algorithm::*;
        matches!(
            (self, alg),
            (
                JwtPublicKey::Rsa(_),
                Rs256 | Rs384 | Rs512 | Ps256 | Ps384 | Ps512
            ) | (JwtPublicKey::P256(_), Es256)
                | (JwtPublicKey::P384(_), Es384)
                | (JwtPublicKey::P521(_), Es512)
        )
    }

    /// Verify a JWS signature over `signing_input` (`header.payload`).
    pub(crate) fn verify(&self, alg: Algorithm, signing_input: &[u8], signature: &[u8]) -> Result<()> {
        if !self.supports(alg) {
            return Err(JwtSvidError::SignatureInvalid(format!(
                "{alg} cannot be verified with an {} key",
                self.key_type()
            )));
        }

        let verified = match self {
            JwtPublicKey::Rsa(key) => verify_rsa(key, alg, signing_input, signature),
            JwtPublicKey::P256(key) => p256::ecdsa::Signature::from_slice(signature)
                .and_then(|sig| key.verify(signing_input, &sig))
                .is_ok(),
            JwtPublicKey::P384(key) => p384::ecdsa::Signature::from_slice(signature)
                .and_then(|sig| key.verify(signing_input, &sig))
                .is_ok(),
            JwtPublicKey::P521(key) => p521::ecdsa::Signature::from_slice(signature)
                .and_then(|sig| key.verify(signing_input, &sig))
                .is_ok(),
        };

        if verified {
            Ok(())
        } else {
            Err(JwtSvidError::SignatureInvalid(format!(
                "{alg} signature does not match"
            )))
        }
    }
}

impl fmt::Debug for JwtPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JwtPublicKey::Rsa(key) => f
                .debug_struct("JwtPublicKey")
                .field("type", &"RSA")
                .field("bits", &key.n().bits())
                .finish(),
            other => f
                .debug_struct("JwtPublicKey")
                .field("type", &other.key_type())
                .finish(),
        }
    }
}

fn p521_from_public_key(key: &p521::PublicKey) -> Result<JwtPublicKey> {
    p521::ecdsa::VerifyingKey::from_sec1_bytes(&key.to_sec1_bytes())
        .map(JwtPublicKey::P521)
        .map_err(|e| JwtSvidError::Key(format!("invalid P-521 point: {e}")))
}

fn verify_rsa(key: &RsaPublicKey, alg: Algorithm, message: &[u8], signature: &[u8]) -> bool {
    let result = match alg {
        Algorithm::Rs256 => key.verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(message), signature),
        Algorithm::Rs384 => key.verify(Pkcs1v15Sign::new::<Sha384>(), &Sha384::digest(message), signature),
        Algorithm::Rs512 => key.verify(Pkcs1v15Sign::new::<Sha512>(), &Sha512::digest(message), signature),
        Algorithm::Ps256 => key.verify(Pss::new::<Sha256>(), &Sha256::digest(message), signature),
        Algorithm::Ps384 => key.verify(Pss::new::<Sha384>(), &Sha384::digest(message), signature),
        Algorithm::Ps512 => key.verify(Pss::new::<Sha512>(), &Sha512::digest(message), signature),
        Algorithm::Es256 | Algorithm::Es384 | Algorithm::Es512 => return false,
    };
    result.is_ok()
}
