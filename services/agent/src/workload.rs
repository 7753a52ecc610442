//! Workload endpoint.
//!
//! Each attested connection carries newline-delimited JSON requests of the
//! form `{"token": "...", "audience": ["..."]}`. Every request gets exactly
//! one JSON line back, either the verified identity or an error code.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use trustbind_identity::{JwtSvidError, JwtSvidValidator, KeyStoreHandle};
use trustbind_peertracker::AttestedStream;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub token: String,
    pub audience: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ValidateResponse {
    Verified {
        spiffe_id: String,
        claims: Map<String, Value>,
    },
    Rejected {
        code: &'static str,
        error: String,
    },
}

impl ValidateResponse {
    fn rejected(code: &'static str, error: impl ToString) -> Self {
        ValidateResponse::Rejected {
            code,
            error: error.to_string(),
        }
    }
}

/// Stable machine-readable code for each rejection kind.
pub fn error_code(err: &JwtSvidError) -> &'static str {
    match err {
        JwtSvidError::Malformed(_) => "malformed",
        JwtSvidError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
        JwtSvidError::MissingKeyId => "missing_key_id",
        JwtSvidError::MalformedSubject(_) => "malformed_subject",
        JwtSvidError::KeyNotFound { .. } => "key_not_found",
        JwtSvidError::SignatureInvalid(_) => "signature_invalid",
        JwtSvidError::Expired => "expired",
        JwtSvidError::NotYetValid(_) => "not_yet_valid",
        JwtSvidError::AudienceMismatch { .. } => "audience_mismatch",
        JwtSvidError::InvalidClaims(_) => "invalid_claims",
        JwtSvidError::Key(_) | JwtSvidError::Core(_) => "unavailable",
    }
}

pub struct WorkloadApi {
    validator: JwtSvidValidator,
    keys: Arc<KeyStoreHandle>,
}

impl WorkloadApi {
    pub fn new(validator: JwtSvidValidator, keys: Arc<KeyStoreHandle>) -> Self {
        Self { validator, keys }
    }

    pub fn keys(&self) -> &Arc<KeyStoreHandle> {
        &self.keys
    }

    /// Answer a single request line.
    pub fn handle_request(&self, line: &str) -> ValidateResponse {
        let request: ValidateRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => return ValidateResponse::rejected("invalid_request", e),
        };
        if request.audience.is_empty() {
            return ValidateResponse::rejected("invalid_request", "audience must not be empty");
        }

        match self
            .validator
            .validate(&request.token, &*self.keys, &request.audience)
        {
            Ok(identity) => {
                let (spiffe_id, claims) = identity.into_parts();
                ValidateResponse::Verified {
                    spiffe_id: spiffe_id.to_string(),
                    claims,
                }
            }
            Err(e) => ValidateResponse::rejected(error_code(&e), e),
        }
    }

    /// Serve one attested connection until the peer hangs up or its
    /// process stops being the one that connected.
    pub async fn serve_connection(&self, stream: AttestedStream) {
        let (stream, caller) = stream.into_parts();
        let pid = caller.pid();
        let uid = caller.uid();
        debug!(pid, uid, "workload connected");

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                status = caller.wait_exited() => {
                    info!(pid, ?status, "caller no longer attested; closing connection");
                    return;
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(pid, error = %e, "workload connection read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = match caller.check() {
                Ok(()) => self.handle_request(&line),
                Err(e) => ValidateResponse::rejected("caller_not_attested", e),
            };
            match &response {
                ValidateResponse::Verified { spiffe_id, .. } => {
                    debug!(pid, uid, spiffe_id = %spiffe_id, "JWT-SVID accepted");
                }
                ValidateResponse::Rejected { code, error } => {
                    warn!(pid, uid, code = *code, error = %error, "JWT-SVID rejected");
                }
            }

            let mut out = match serde_json::to_vec(&response) {
                Ok(out) => out,
                Err(e) => {
                    warn!(pid, error = %e, "failed to encode response");
                    break;
                }
            };
            out.push(b'\n');
            if let Err(e) = writer.write_all(&out).await {
                debug!(pid, error = %e, "workload connection write failed");
                break;
            }
            if matches!(response, ValidateResponse::Rejected { code: "caller_not_attested", .. }) {
                break;
            }
        }
        debug!(pid, "workload disconnected");
    }
}
