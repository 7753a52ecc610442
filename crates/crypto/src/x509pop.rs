//! X.509 certificate proof-of-possession.
//!
//! The node presents a certificate chain (leaf first). The verifier checks
//! that the leaf key may be used for digital signatures, challenges the node
//! with a fresh nonce, and verifies the signature over
//! `SHA-256(challenge || response)` with the key from the leaf certificate:
//! RSA-PSS/SHA-256 for RSA keys, ECDSA for P-256, P-384 and P-521 keys.
//!
//! Messages are JSON with byte fields in standard base64, compatible with
//! existing agents speaking this protocol.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use tracing::{debug, warn};
use trustbind_core::{AgentPathTemplate, SpiffeId, TrustDomain};
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{PopError, Result};
use crate::nonce::{combine_nonces, generate_nonce};
use crate::wire::{base64_bytes, base64_seq};

pub const PLUGIN_NAME: &str = "x509pop";

const SHA256_LEN: usize = 32;
const P521_FIELD_LEN: usize = 66;

/// Public key taken from a presented certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::PublicKey),
}

impl PublicKey {
    /// Parse a DER `SubjectPublicKeyInfo`.
    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
            return Ok(PublicKey::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(PublicKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(PublicKey::P384(key));
        }
        if let Ok(key) = p521::PublicKey::from_public_key_der(der) {
            return Ok(PublicKey::P521(key));
        }
        Err(PopError::UnsupportedKeyType(
            "certificate key is not RSA or ECDSA P-256, P-384 or P-521".to_string(),
        ))
    }

    /// Extract the key of a certificate, enforcing that its key usage
    /// permits digital signatures.
    pub fn from_certificate(cert: &X509Certificate<'_>) -> Result<Self> {
        let key_usage = cert
            .key_usage()
            .map_err(|e| PopError::Malformed(format!("invalid key usage extension: {e}")))?;
        if !key_usage.is_some_and(|ku| ku.value.digital_signature()) {
            return Err(PopError::KeyUsageNotPermitted(
                "certificate not intended for digital signature use".to_string(),
            ));
        }
        Self::from_spki_der(cert.public_key().raw)
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            PublicKey::Rsa(_) => "RSA",
            PublicKey::P256(_) => "ECDSA P-256",
            PublicKey::P384(_) => "ECDSA P-384",
            PublicKey::P521(_) => "ECDSA P-521",
        }
    }
}

/// Node-side private key.
pub enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::SecretKey),
}

impl PrivateKey {
    /// Load a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::P384(key));
        }
        if let Ok(key) = p521::SecretKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::P521(key));
        }
        Err(PopError::UnsupportedKeyType(
            "private key is not a PKCS#8 RSA or ECDSA P-256, P-384 or P-521 key".to_string(),
        ))
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::Rsa(key) => PublicKey::Rsa(key.to_public_key()),
            PrivateKey::P256(key) => PublicKey::P256(key.verifying_key().clone()),
            PrivateKey::P384(key) => PublicKey::P384(key.verifying_key().clone()),
            PrivateKey::P521(key) => PublicKey::P521(key.public_key()),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey")
            .field(&self.public_key().algorithm())
            .finish()
    }
}

/// Certificate chain presented by the node, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationData {
    #[serde(with = "base64_seq")]
    pub certificates: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaSignatureChallenge {
    /// Nonce generated by the challenger
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaSignatureResponse {
    /// Nonce generated by the responder
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// RSA-PSS signature over the combined nonces
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaSignatureChallenge {
    /// Nonce generated by the challenger
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaSignatureResponse {
    /// Nonce generated by the responder
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Big-endian `r` scalar
    #[serde(with = "base64_bytes")]
    pub r: Vec<u8>,
    /// Big-endian `s` scalar
    #[serde(with = "base64_bytes")]
    pub s: Vec<u8>,
}

/// Challenge envelope; exactly one member matches the credential's key type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_signature: Option<RsaSignatureChallenge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecdsa_signature: Option<EcdsaSignatureChallenge>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_signature: Option<RsaSignatureResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecdsa_signature: Option<EcdsaSignatureResponse>,
}

/// Mint a challenge for the given credential key.
pub fn generate_challenge(key: &PublicKey) -> Result<Challenge> {
    let nonce = generate_nonce()?;
    Ok(match key {
        PublicKey::Rsa(_) => Challenge {
            rsa_signature: Some(RsaSignatureChallenge { nonce }),
            ecdsa_signature: None,
        },
        PublicKey::P256(_) | PublicKey::P384(_) | PublicKey::P521(_) => Challenge {
            rsa_signature: None,
            ecdsa_signature: Some(EcdsaSignatureChallenge { nonce }),
        },
    })
}

/// Answer a challenge with a fresh response nonce and a signature.
pub fn calculate_response(key: &PrivateKey, challenge: &Challenge) -> Result<Response> {
    match key {
        PrivateKey::Rsa(key) => {
            let challenge = challenge
                .rsa_signature
                .as_ref()
                .ok_or(PopError::MissingChallenge("expecting RSA challenge"))?;
            let nonce = generate_nonce()?;
            let digest = combine_nonces(&challenge.nonce, &nonce)?;
            let signature = key
                .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
                .map_err(|e| PopError::Signing(e.to_string()))?;
            Ok(Response {
                rsa_signature: Some(RsaSignatureResponse { nonce, signature }),
                ecdsa_signature: None,
            })
        }
        PrivateKey::P256(key) => {
            let (nonce, digest) = ecdsa_inputs(challenge)?;
            let signature: p256::ecdsa::Signature = key
                .sign_prehash(&digest)
                .map_err(|e| PopError::Signing(e.to_string()))?;
            let (r, s) = signature.split_bytes();
            Ok(ecdsa_response(nonce, r.to_vec(), s.to_vec()))
        }
        PrivateKey::P384(key) => {
            let (nonce, digest) = ecdsa_inputs(challenge)?;
            let signature: p384::ecdsa::Signature = key
                .sign_prehash(&digest)
                .map_err(|e| PopError::Signing(e.to_string()))?;
            let (r, s) = signature.split_bytes();
            Ok(ecdsa_response(nonce, r.to_vec(), s.to_vec()))
        }
        PrivateKey::P521(key) => {
            let (nonce, digest) = ecdsa_inputs(challenge)?;
            let signer = p521::ecdsa::SigningKey::from_bytes(&key.to_bytes())
                .map_err(|e| PopError::Signing(e.to_string()))?;
            let signature: p521::ecdsa::Signature = signer
                .sign_prehash(&p521_prehash(&digest))
                .map_err(|e| PopError::Signing(e.to_string()))?;
            let (r, s) = signature.split_bytes();
            Ok(ecdsa_response(nonce, r.to_vec(), s.to_vec()))
        }
    }
}

/// P-521 refuses prehashes shorter than half its field. Zero-extending the
/// digest on the left keeps its integer value, matching other ECDSA signers.
fn p521_prehash(digest: &[u8; SHA256_LEN]) -> [u8; P521_FIELD_LEN] {
    let mut prehash = [0u8; P521_FIELD_LEN];
    prehash[P521_FIELD_LEN - SHA256_LEN..].copy_from_slice(digest);
    prehash
}

fn ecdsa_inputs(challenge: &Challenge) -> Result<(Vec<u8>, [u8; 32])> {
    let challenge = challenge
        .ecdsa_signature
        .as_ref()
        .ok_or(PopError::MissingChallenge("expecting ECDSA challenge"))?;
    let nonce = generate_nonce()?;
    let digest = combine_nonces(&challenge.nonce, &nonce)?;
    Ok((nonce, digest))
}

fn ecdsa_response(nonce: Vec<u8>, r: Vec<u8>, s: Vec<u8>) -> Response {
    Response {
        rsa_signature: None,
        ecdsa_signature: Some(EcdsaSignatureResponse { nonce, r, s }),
    }
}

/// Verify a response against the challenge that was sent and the key from
/// the originally presented certificate.
pub fn verify_challenge_response(
    key: &PublicKey,
    challenge: &Challenge,
    response: &Response,
) -> Result<()> {
    match key {
        PublicKey::Rsa(key) => {
            let challenge = challenge
                .rsa_signature
                .as_ref()
                .ok_or(PopError::MissingChallenge("expecting RSA challenge"))?;
            let response = response
                .rsa_signature
                .as_ref()
                .ok_or(PopError::MissingResponse("expecting RSA response"))?;
            let digest = combine_nonces(&challenge.nonce, &response.nonce)?;
            verify_pss(key, &digest, &response.signature)
        }
        PublicKey::P256(key) => {
            let (digest, rs) = ecdsa_parts(challenge, response, 32)?;
            let signature = p256::ecdsa::Signature::from_slice(&rs)
                .map_err(|_| PopError::SignatureInvalid("malformed ECDSA signature".to_string()))?;
            key.verify_prehash(&digest, &signature)
                .map_err(|_| PopError::SignatureInvalid("ECDSA signature verify failed".to_string()))
        }
        PublicKey::P384(key) => {
            let (digest, rs) = ecdsa_parts(challenge, response, 48)?;
            let signature = p384::ecdsa::Signature::from_slice(&rs)
                .map_err(|_| PopError::SignatureInvalid("malformed ECDSA signature".to_string()))?;
            key.verify_prehash(&digest, &signature)
                .map_err(|_| PopError::SignatureInvalid("ECDSA signature verify failed".to_string()))
        }
        PublicKey::P521(key) => {
            let (digest, rs) = ecdsa_parts(challenge, response, P521_FIELD_LEN)?;
            let signature = p521::ecdsa::Signature::from_slice(&rs)
                .map_err(|_| PopError::SignatureInvalid("malformed ECDSA signature".to_string()))?;
            let verifier = p521::ecdsa::VerifyingKey::from_affine(*key.as_affine())
                .map_err(|_| PopError::SignatureInvalid("invalid ECDSA P-521 key".to_string()))?;
            verifier
                .verify_prehash(&p521_prehash(&digest), &signature)
                .map_err(|_| PopError::SignatureInvalid("ECDSA signature verify failed".to_string()))
        }
    }
}

/// Digest and fixed-width `r || s` for an ECDSA response.
fn ecdsa_parts(
    challenge: &Challenge,
    response: &Response,
    field_len: usize,
) -> Result<([u8; 32], Vec<u8>)> {
    let challenge = challenge
        .ecdsa_signature
        .as_ref()
        .ok_or(PopError::MissingChallenge("expecting ECDSA challenge"))?;
    let response = response
        .ecdsa_signature
        .as_ref()
        .ok_or(PopError::MissingResponse("expecting ECDSA response"))?;
    let digest = combine_nonces(&challenge.nonce, &response.nonce)?;

    let mut rs = left_pad(&response.r, field_len)?;
    rs.extend(left_pad(&response.s, field_len)?);
    Ok((digest, rs))
}

/// Scalars may arrive minimally encoded (leading zeros stripped).
fn left_pad(scalar: &[u8], width: usize) -> Result<Vec<u8>> {
    let start = scalar.iter().position(|b| *b != 0).unwrap_or(scalar.len());
    let trimmed = &scalar[start..];
    if trimmed.len() > width {
        return Err(PopError::SignatureInvalid(
            "ECDSA signature scalar exceeds curve size".to_string(),
        ));
    }
    let mut padded = vec![0u8; width - trimmed.len()];
    padded.extend_from_slice(trimmed);
    Ok(padded)
}

/// RSA-PSS/SHA-256 verification accepting a digest-length salt or the
/// maximum salt length for the modulus.
fn verify_pss(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
    if key.verify(Pss::new::<Sha256>(), digest, signature).is_ok() {
        return Ok(());
    }
    let em_len = (key.n().bits() + 6) / 8;
    let max_salt = em_len.saturating_sub(SHA256_LEN + 2);
    key.verify(Pss::new_with_salt::<Sha256>(max_salt), digest, signature)
        .map_err(|_| PopError::SignatureInvalid("RSA signature verify failed".to_string()))
}

/// Lowercase hex SHA-1 of the certificate DER.
pub fn fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha1::digest(cert_der))
}

pub fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (rest, cert) = X509Certificate::from_der(der)
        .map_err(|e| PopError::Malformed(format!("unable to parse certificate: {e}")))?;
    if !rest.is_empty() {
        return Err(PopError::Malformed(
            "trailing data after certificate".to_string(),
        ));
    }
    Ok(cert)
}

/// DER certificates contained in a PEM bundle, in file order.
pub fn certificates_from_pem(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut certificates = Vec::new();
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block =
            block.map_err(|e| PopError::Configuration(format!("invalid PEM data: {e}")))?;
        if block.label == "CERTIFICATE" {
            certificates.push(block.contents);
        }
    }
    if certificates.is_empty() {
        return Err(PopError::Configuration(
            "no certificates found in PEM data".to_string(),
        ));
    }
    Ok(certificates)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentPathData<'a> {
    plugin_name: &'static str,
    fingerprint: String,
    trust_domain: &'a str,
    subject_common_name: &'a str,
    serial_number: String,
}

/// Derive the agent SPIFFE ID for an attested leaf certificate.
pub fn make_agent_id(
    trust_domain: &TrustDomain,
    template: &AgentPathTemplate,
    cert_der: &[u8],
) -> Result<SpiffeId> {
    let cert = parse_certificate(cert_der)?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default();

    let path = template.render(&AgentPathData {
        plugin_name: PLUGIN_NAME,
        fingerprint: fingerprint(cert_der),
        trust_domain: trust_domain.as_str(),
        subject_common_name: common_name,
        serial_number: cert.tbs_certificate.serial.to_string(),
    })?;
    Ok(SpiffeId::agent_id(trust_domain, &path)?)
}

/// Node-side configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// PKCS#8 PEM private key
    pub private_key_path: PathBuf,
    /// PEM certificate chain, leaf first
    pub certificate_path: PathBuf,
}

/// Node side of the X.509 proof-of-possession exchange.
#[derive(Debug)]
pub struct Client {
    key: PrivateKey,
    certificates: Vec<Vec<u8>>,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let key = std::fs::read_to_string(&config.private_key_path).map_err(|e| {
            PopError::Configuration(format!(
                "failed to read private key {}: {e}",
                config.private_key_path.display()
            ))
        })?;
        let chain = std::fs::read_to_string(&config.certificate_path).map_err(|e| {
            PopError::Configuration(format!(
                "failed to read certificate {}: {e}",
                config.certificate_path.display()
            ))
        })?;
        Self::from_pem(&chain, &key)
    }

    /// Build from in-memory PEM material. The leaf must match the key.
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self> {
        let key = PrivateKey::from_pkcs8_pem(private_key_pem)?;
        let certificates = certificates_from_pem(certificate_pem)?;
        let leaf = parse_certificate(&certificates[0])
            .map_err(|e| PopError::Configuration(e.to_string()))?;
        let leaf_key = PublicKey::from_spki_der(leaf.public_key().raw)?;
        if leaf_key != key.public_key() {
            return Err(PopError::Configuration(
                "leaf certificate does not match private key".to_string(),
            ));
        }
        Ok(Self { key, certificates })
    }

    pub fn attestation_data(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&AttestationData {
            certificates: self.certificates.clone(),
        })
        .map_err(|e| PopError::Malformed(e.to_string()))
    }

    pub fn respond_to_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let challenge: Challenge = serde_json::from_slice(challenge)
            .map_err(|e| PopError::Malformed(format!("unable to decode challenge: {e}")))?;
        let response = calculate_response(&self.key, &challenge)?;
        serde_json::to_vec(&response).map_err(|e| PopError::Malformed(e.to_string()))
    }
}

/// Server-side configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub agent_path_template: Option<String>,
}

/// Verifier factory; immutable once built.
#[derive(Debug)]
pub struct Server {
    trust_domain: TrustDomain,
    agent_path_template: AgentPathTemplate,
}

impl Server {
    pub fn new(trust_domain: &str, config: &ServerConfig) -> Result<Self> {
        let trust_domain = TrustDomain::new(trust_domain).map_err(|e| {
            PopError::Configuration(format!("trust_domain configuration is invalid: {e}"))
        })?;
        let agent_path_template =
            AgentPathTemplate::parse_or_default(config.agent_path_template.as_deref())?;
        Ok(Self {
            trust_domain,
            agent_path_template,
        })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }
}

struct AttestedLeaf {
    der: Vec<u8>,
    key: PublicKey,
}

enum Stage {
    Init,
    AttestationDataVerified(AttestedLeaf),
    ChallengeIssued(AttestedLeaf, Challenge),
    ChallengeVerified(AttestedLeaf),
    Failed,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::AttestationDataVerified(..) => "attestation data verified",
            Stage::ChallengeIssued(..) => "challenge issued",
            Stage::ChallengeVerified(..) => "challenge verified",
            Stage::Failed => "failed",
        }
    }
}

/// One attestation attempt. Any error leaves the handshake failed.
pub struct ServerHandshake {
    server: Arc<Server>,
    stage: Stage,
}

impl ServerHandshake {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            stage: Stage::Init,
        }
    }

    pub fn verify_attestation_data(&mut self, data: &[u8]) -> Result<()> {
        match self.take_stage() {
            Stage::Init => {}
            other => return Err(out_of_order("init", &other)),
        }

        let data: AttestationData = serde_json::from_slice(data).map_err(|e| {
            PopError::Malformed(format!("unable to decode attestation data: {e}"))
        })?;
        let der = data
            .certificates
            .into_iter()
            .next()
            .ok_or_else(|| PopError::Malformed("no certificate to attest".to_string()))?;

        let key = {
            let cert = parse_certificate(&der)?;
            if !cert.validity().is_valid() {
                return Err(PopError::CertificateRejected(
                    "certificate is outside its validity period".to_string(),
                ));
            }
            PublicKey::from_certificate(&cert)?
        };

        debug!(
            fingerprint = %fingerprint(&der),
            algorithm = key.algorithm(),
            "verified x509pop attestation data"
        );
        self.stage = Stage::AttestationDataVerified(AttestedLeaf { der, key });
        Ok(())
    }

    pub fn issue_challenge(&mut self) -> Result<Vec<u8>> {
        let leaf = match self.take_stage() {
            Stage::AttestationDataVerified(leaf) => leaf,
            other => return Err(out_of_order("attestation data verified", &other)),
        };
        let challenge = generate_challenge(&leaf.key)?;
        let encoded =
            serde_json::to_vec(&challenge).map_err(|e| PopError::Malformed(e.to_string()))?;
        self.stage = Stage::ChallengeIssued(leaf, challenge);
        Ok(encoded)
    }

    pub fn verify_challenge_response(&mut self, response: &[u8]) -> Result<()> {
        let (leaf, challenge) = match self.take_stage() {
            Stage::ChallengeIssued(leaf, challenge) => (leaf, challenge),
            other => return Err(out_of_order("challenge issued", &other)),
        };
        let response: Response = serde_json::from_slice(response)
            .map_err(|e| PopError::Malformed(format!("unable to decode response: {e}")))?;

        if let Err(e) = verify_challenge_response(&leaf.key, &challenge, &response) {
            warn!(fingerprint = %fingerprint(&leaf.der), error = %e, "x509pop challenge response rejected");
            return Err(e);
        }
        self.stage = Stage::ChallengeVerified(leaf);
        Ok(())
    }

    pub fn agent_id(&self) -> Result<SpiffeId> {
        match &self.stage {
            Stage::ChallengeVerified(leaf) => make_agent_id(
                &self.server.trust_domain,
                &self.server.agent_path_template,
                &leaf.der,
            ),
            other => Err(out_of_order("challenge verified", other)),
        }
    }

    /// DER of the attested leaf certificate, once attestation data is verified.
    pub fn leaf_certificate(&self) -> Option<&[u8]> {
        match &self.stage {
            Stage::AttestationDataVerified(leaf)
            | Stage::ChallengeIssued(leaf, _)
            | Stage::ChallengeVerified(leaf) => Some(&leaf.der),
            Stage::Init | Stage::Failed => None,
        }
    }

    fn take_stage(&mut self) -> Stage {
        std::mem::replace(&mut self.stage, Stage::Failed)
    }
}

fn out_of_order(expected: &'static str, actual: &Stage) -> PopError {
    PopError::HandshakeState {
        expected,
        actual: actual.name(),
    }
}
