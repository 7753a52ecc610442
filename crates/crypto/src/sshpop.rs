//! SSH host certificate proof-of-possession.
//!
//! The node presents its OpenSSH host certificate. The verifier accepts it
//! only if it is a host certificate with at least one principal, signed by a
//! configured certificate authority (matched by the SHA-256 fingerprint of
//! the authority key) and within its validity window. The node then signs
//! `SHA-256(challenge || response)` with the host private key.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signature::{Signer, Verifier};
use ssh_encoding::{Decode, Encode};

/// Encodes a value into a freshly allocated buffer (ssh-encoding 0.2 lacks `encode_vec`).
trait EncodeToVec: Encode {
    fn encode_vec(&self) -> core::result::Result<Vec<u8>, ssh_encoding::Error> {
        let mut buf = Vec::with_capacity(self.encoded_len()?);
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Encode> EncodeToVec for T {}
use ssh_key::certificate::CertType;
use ssh_key::{Certificate, Fingerprint, HashAlg, PrivateKey, PublicKey};
use tracing::{debug, warn};
use trustbind_core::{AgentPathTemplate, SpiffeId, TrustDomain};

use crate::error::{PopError, Result};
use crate::nonce::{combine_nonces, generate_nonce};
use crate::wire::base64_bytes;

pub const PLUGIN_NAME: &str = "sshpop";

pub const DEFAULT_HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_rsa_key";
pub const DEFAULT_HOST_CERT_PATH: &str = "/etc/ssh/ssh_host_rsa_key-cert.pub";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AttestationData {
    /// Certificate in SSH wire encoding
    #[serde(with = "base64_bytes")]
    certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChallengeRequest {
    #[serde(with = "base64_bytes")]
    nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChallengeResponse {
    #[serde(with = "base64_bytes")]
    nonce: Vec<u8>,
    /// SSH signature blob over the combined nonces
    #[serde(with = "base64_bytes")]
    signature: Vec<u8>,
}

/// Node-side configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host_key_path: PathBuf,
    pub host_cert_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_key_path: PathBuf::from(DEFAULT_HOST_KEY_PATH),
            host_cert_path: PathBuf::from(DEFAULT_HOST_CERT_PATH),
        }
    }
}

/// Node side: host certificate plus the matching host key.
#[derive(Debug)]
pub struct Client {
    cert: Certificate,
    key: PrivateKey,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let key = std::fs::read_to_string(&config.host_key_path).map_err(|e| {
            PopError::Configuration(format!(
                "failed to read host key file {}: {e}",
                config.host_key_path.display()
            ))
        })?;
        let cert = std::fs::read_to_string(&config.host_cert_path).map_err(|e| {
            PopError::Configuration(format!(
                "failed to read host cert file {}: {e}",
                config.host_cert_path.display()
            ))
        })?;
        Self::from_openssh(&cert, &key)
    }

    /// Build from an OpenSSH certificate line and an OpenSSH private key.
    pub fn from_openssh(cert: &str, key: &str) -> Result<Self> {
        let key = PrivateKey::from_openssh(key)
            .map_err(|e| PopError::Configuration(format!("failed to parse host key: {e}")))?;
        if key.is_encrypted() {
            return Err(PopError::Configuration(
                "host key is passphrase protected".to_string(),
            ));
        }
        let cert = Certificate::from_openssh(cert.trim())
            .map_err(|e| PopError::Configuration(format!("pubkey isn't a certificate: {e}")))?;
        if cert.public_key() != key.public_key().key_data() {
            return Err(PopError::Configuration(
                "host certificate does not match host key".to_string(),
            ));
        }
        Ok(Self { cert, key })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn new_handshake(&self) -> ClientHandshake<'_> {
        ClientHandshake {
            client: self,
            sent_attestation_data: false,
        }
    }
}

/// Node side of one attestation attempt.
#[derive(Debug)]
pub struct ClientHandshake<'a> {
    client: &'a Client,
    sent_attestation_data: bool,
}

impl ClientHandshake<'_> {
    pub fn attestation_data(&mut self) -> Result<Vec<u8>> {
        let certificate = self
            .client
            .cert
            .encode_vec()
            .map_err(|e| PopError::Malformed(format!("unable to encode certificate: {e}")))?;
        let encoded = serde_json::to_vec(&AttestationData { certificate })
            .map_err(|e| PopError::Malformed(e.to_string()))?;
        self.sent_attestation_data = true;
        Ok(encoded)
    }

    pub fn respond_to_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if !self.sent_attestation_data {
            return Err(PopError::HandshakeState {
                expected: "attestation data provided",
                actual: "init",
            });
        }
        let request: ChallengeRequest = serde_json::from_slice(challenge)
            .map_err(|e| PopError::Malformed(format!("unable to decode challenge: {e}")))?;

        let nonce = generate_nonce()?;
        let digest = combine_nonces(&request.nonce, &nonce)?;
        let signature: ssh_key::Signature = self
            .client
            .key
            .try_sign(&digest)
            .map_err(|e| PopError::Signing(e.to_string()))?;
        let signature = signature
            .encode_vec()
            .map_err(|e| PopError::Signing(e.to_string()))?;

        serde_json::to_vec(&ChallengeResponse { nonce, signature })
            .map_err(|e| PopError::Malformed(e.to_string()))
    }
}

/// Server-side configuration. At least one authority is required, inline or
/// from a file holding one OpenSSH public key per line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub cert_authorities: Vec<String>,
    pub cert_authorities_path: Option<PathBuf>,
    /// Domain suffix stripped from the certificate's principal
    pub canonical_domain: Option<String>,
    pub agent_path_template: Option<String>,
}

/// Verifier factory holding the trusted authority set.
#[derive(Debug)]
pub struct Server {
    trust_domain: TrustDomain,
    authorities: Vec<Fingerprint>,
    canonical_domain: Option<String>,
    agent_path_template: AgentPathTemplate,
}

impl Server {
    pub fn new(trust_domain: &str, config: &ServerConfig) -> Result<Self> {
        let trust_domain = TrustDomain::new(trust_domain).map_err(|e| {
            PopError::Configuration(format!("trust_domain configuration is invalid: {e}"))
        })?;

        if config.cert_authorities.is_empty() && config.cert_authorities_path.is_none() {
            return Err(PopError::Configuration(
                "missing required config value for \"cert_authorities\" or \"cert_authorities_path\""
                    .to_string(),
            ));
        }

        let mut lines = config.cert_authorities.clone();
        if let Some(path) = &config.cert_authorities_path {
            lines.extend(authorities_from_path(path)?);
        }

        let mut authorities = Vec::with_capacity(lines.len());
        for line in &lines {
            let key = PublicKey::from_openssh(line.trim()).map_err(|e| {
                PopError::Configuration(format!("failed to parse public key {line:?}: {e}"))
            })?;
            let fingerprint = key.fingerprint(HashAlg::Sha256);
            if !authorities.contains(&fingerprint) {
                authorities.push(fingerprint);
            }
        }
        if authorities.is_empty() {
            return Err(PopError::Configuration(
                "must provide at least one cert authority".to_string(),
            ));
        }

        let agent_path_template =
            AgentPathTemplate::parse_or_default(config.agent_path_template.as_deref())?;

        Ok(Self {
            trust_domain,
            authorities,
            canonical_domain: config
                .canonical_domain
                .clone()
                .filter(|domain| !domain.is_empty()),
            agent_path_template,
        })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// SHA-256 fingerprints of the trusted authorities.
    pub fn authorities(&self) -> &[Fingerprint] {
        &self.authorities
    }
}

fn authorities_from_path(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PopError::Configuration(format!(
            "failed to get cert authorities from file {}: {e}",
            path.display()
        ))
    })?;
    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        return Err(PopError::Configuration(format!(
            "no data found in file: {}",
            path.display()
        )));
    }
    Ok(lines)
}

struct AttestedHost {
    cert: Certificate,
    fingerprint: String,
    hostname: String,
}

enum Stage {
    Init,
    AttestationDataVerified(AttestedHost),
    ChallengeIssued(AttestedHost, Vec<u8>),
    ChallengeVerified(AttestedHost),
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

/// Verifier side of one attestation attempt. Any error leaves the
/// handshake failed.
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
        let mut reader = data.certificate.as_slice();
        let cert = Certificate::decode(&mut reader).map_err(|e| {
            PopError::Malformed(format!("attestation data is not an SSH certificate: {e}"))
        })?;
        if !reader.is_empty() {
            return Err(PopError::Malformed(
                "trailing data after certificate".to_string(),
            ));
        }

        let host = self.check_certificate(cert, &data.certificate)?;
        debug!(
            hostname = %host.hostname,
            key_id = host.cert.key_id(),
            "verified sshpop attestation data"
        );
        self.stage = Stage::AttestationDataVerified(host);
        Ok(())
    }

    fn check_certificate(&self, cert: Certificate, wire: &[u8]) -> Result<AttestedHost> {
        if cert.cert_type() != CertType::Host {
            return Err(PopError::CertificateRejected(
                "cert is not a host cert".to_string(),
            ));
        }
        let principal = cert
            .valid_principals()
            .first()
            .cloned()
            .ok_or_else(|| PopError::CertificateRejected("cert has no valid principals".to_string()))?;

        let authority = cert.signature_key().fingerprint(HashAlg::Sha256);
        if !self.server.authorities.contains(&authority) {
            warn!(authority = %authority, "sshpop certificate signed by untrusted authority");
            return Err(PopError::UntrustedAuthority(authority.to_string()));
        }
        if !cert.critical_options().is_empty() {
            return Err(PopError::CertificateRejected(
                "cert carries unsupported critical options".to_string(),
            ));
        }

        cert.validate_at(unix_now()?, &self.server.authorities)
            .map_err(|e| PopError::CertificateRejected(format!("failed to check host key: {e}")))?;

        let hostname =
            decanonicalize_hostname(&principal, self.server.canonical_domain.as_deref())?;
        Ok(AttestedHost {
            cert,
            fingerprint: URL_SAFE_NO_PAD.encode(Sha256::digest(wire)),
            hostname,
        })
    }

    pub fn issue_challenge(&mut self) -> Result<Vec<u8>> {
        let host = match self.take_stage() {
            Stage::AttestationDataVerified(host) => host,
            other => return Err(out_of_order("attestation data verified", &other)),
        };
        let nonce = generate_nonce()?;
        let encoded = serde_json::to_vec(&ChallengeRequest {
            nonce: nonce.clone(),
        })
        .map_err(|e| PopError::Malformed(e.to_string()))?;
        self.stage = Stage::ChallengeIssued(host, nonce);
        Ok(encoded)
    }

    pub fn verify_challenge_response(&mut self, response: &[u8]) -> Result<()> {
        let (host, challenge) = match self.take_stage() {
            Stage::ChallengeIssued(host, challenge) => (host, challenge),
            other => return Err(out_of_order("challenge issued", &other)),
        };
        let response: ChallengeResponse = serde_json::from_slice(response)
            .map_err(|e| PopError::Malformed(format!("unable to decode response: {e}")))?;

        let digest = combine_nonces(&challenge, &response.nonce)?;
        let signature = ssh_key::Signature::decode(&mut response.signature.as_slice())
            .map_err(|e| PopError::SignatureInvalid(format!("malformed signature: {e}")))?;
        let host_key = PublicKey::from(host.cert.public_key().clone());
        if let Err(e) = Verifier::verify(&host_key, &digest, &signature) {
            warn!(hostname = %host.hostname, "sshpop challenge response rejected");
            return Err(PopError::SignatureInvalid(format!(
                "failed to verify signature: {e}"
            )));
        }

        self.stage = Stage::ChallengeVerified(host);
        Ok(())
    }

    pub fn agent_id(&self) -> Result<SpiffeId> {
        let host = match &self.stage {
            Stage::ChallengeVerified(host) => host,
            other => return Err(out_of_order("challenge verified", other)),
        };
        let path = self.server.agent_path_template.render(&AgentPathData {
            plugin_name: PLUGIN_NAME,
            fingerprint: &host.fingerprint,
            hostname: &host.hostname,
            key_id: host.cert.key_id(),
            serial: host.cert.serial(),
            valid_principals: host.cert.valid_principals(),
        })?;
        Ok(SpiffeId::agent_id(&self.server.trust_domain, &path)?)
    }

    /// Hostname derived from the certificate, once attestation data is verified.
    pub fn hostname(&self) -> Option<&str> {
        match &self.stage {
            Stage::AttestationDataVerified(host)
            | Stage::ChallengeIssued(host, _)
            | Stage::ChallengeVerified(host) => Some(&host.hostname),
            Stage::Init | Stage::Failed => None,
        }
    }

    fn take_stage(&mut self) -> Stage {
        std::mem::replace(&mut self.stage, Stage::Failed)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentPathData<'a> {
    plugin_name: &'static str,
    fingerprint: &'a str,
    hostname: &'a str,
    key_id: &'a str,
    serial: u64,
    valid_principals: &'a [String],
}

fn out_of_order(expected: &'static str, actual: &Stage) -> PopError {
    PopError::HandshakeState {
        expected,
        actual: actual.name(),
    }
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|e| PopError::CertificateRejected(format!("system clock is before the epoch: {e}")))
}

/// Strip the canonical domain from a principal (see `CanonicalDomains` in
/// ssh_config(5)).
fn decanonicalize_hostname(principal: &str, canonical_domain: Option<&str>) -> Result<String> {
    let Some(domain) = canonical_domain else {
        return Ok(principal.to_string());
    };
    principal
        .strip_suffix(&format!(".{domain}"))
        .filter(|hostname| !hostname.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            PopError::CertificateRejected(format!(
                "cert principal {principal:?} is not in domain {domain:?}"
            ))
        })
}
