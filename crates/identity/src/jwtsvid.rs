//! JWT-SVID validation.
//!
//! Validation order matters: the algorithm allow-list and key id are checked
//! before any key is looked up, the subject is read unverified only to pick
//! the trust domain whose keys apply, and the claim map handed back to the
//! caller is decoded only after the signature verifies.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use trustbind_core::SpiffeId;

use crate::error::{JwtSvidError, Result};
use crate::key::Algorithm;
use crate::keystore::KeyStore;

/// Default clock skew tolerated on time-based claims (seconds).
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Clock skew tolerated when checking `exp`, `nbf` and `iat`
    pub leeway_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            leeway_secs: DEFAULT_LEEWAY_SECS,
        }
    }
}

/// Identity asserted by a token whose signature and claims were verified.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    spiffe_id: SpiffeId,
    claims: Map<String, Value>,
}

impl VerifiedIdentity {
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Every claim in the verified payload, registered or private.
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn into_parts(self) -> (SpiffeId, Map<String, Value>) {
        (self.spiffe_id, self.claims)
    }
}

#[derive(Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    kid: String,
}

/// Only the subject is read before verification.
#[derive(Deserialize)]
struct UnverifiedClaims {
    #[serde(default)]
    sub: Option<Value>,
}

struct CompactJws<'a> {
    header: Header,
    signing_input: &'a str,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| JwtSvidError::Malformed(format!("{what} is not base64url: {e}")))
}

/// Split a compact JWS. The compact form carries exactly one protected
/// header and one signature; anything else is refused here.
fn parse_compact(token: &str) -> Result<CompactJws<'_>> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(JwtSvidError::Malformed(
            "expected a compact JWS with three segments".to_string(),
        ));
    };
    if signature.is_empty() {
        return Err(JwtSvidError::Malformed("token is unsigned".to_string()));
    }

    let signing_input = &token[..header.len() + 1 + payload.len()];
    let header: Header = serde_json::from_slice(&decode_segment(header, "header")?)
        .map_err(|e| JwtSvidError::Malformed(format!("invalid header: {e}")))?;

    Ok(CompactJws {
        header,
        signing_input,
        payload: decode_segment(payload, "payload")?,
        signature: decode_segment(signature, "signature")?,
    })
}

/// Validates JWT-SVIDs against a [`KeyStore`].
#[derive(Debug, Clone)]
pub struct JwtSvidValidator {
    leeway: Duration,
}

impl Default for JwtSvidValidator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

impl JwtSvidValidator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            leeway: Duration::from_secs(config.leeway_secs),
        }
    }

    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Validate `token` and return the identity it asserts. The token must
    /// name at least one of `audience`.
    pub fn validate<K, A>(&self, token: &str, keys: &K, audience: &[A]) -> Result<VerifiedIdentity>
    where
        K: KeyStore + ?Sized,
        A: AsRef<str>,
    {
        self.validate_at(token, keys, audience, SystemTime::now())
    }

    /// As [`JwtSvidValidator::validate`], evaluating time claims at `now`.
    pub fn validate_at<K, A>(
        &self,
        token: &str,
        keys: &K,
        audience: &[A],
        now: SystemTime,
    ) -> Result<VerifiedIdentity>
    where
        K: KeyStore + ?Sized,
        A: AsRef<str>,
    {
        let jws = parse_compact(token)?;

        let alg: Algorithm = jws.header.alg.parse()?;
        if jws.header.kid.is_empty() {
            return Err(JwtSvidError::MissingKeyId);
        }

        let unverified: UnverifiedClaims = serde_json::from_slice(&jws.payload)
            .map_err(|e| JwtSvidError::Malformed(format!("invalid claims: {e}")))?;
        let subject = match unverified.sub {
            Some(Value::String(sub)) if !sub.is_empty() => sub,
            None | Some(Value::String(_)) => {
                return Err(JwtSvidError::MalformedSubject(
                    "token missing subject claim".to_string(),
                ))
            }
            Some(_) => {
                return Err(JwtSvidError::MalformedSubject(
                    "subject claim is not a string".to_string(),
                ))
            }
        };
        let spiffe_id = SpiffeId::parse(&subject)
            .map_err(|e| JwtSvidError::MalformedSubject(e.to_string()))?;

        let key = keys.find_public_key(spiffe_id.trust_domain(), &jws.header.kid)?;
        key.verify(alg, jws.signing_input.as_bytes(), &jws.signature)?;

        let claims: Map<String, Value> = serde_json::from_slice(&jws.payload)
            .map_err(|e| JwtSvidError::Malformed(format!("invalid claims: {e}")))?;
        self.check_registered_claims(&claims, audience, now)?;

        debug!(
            spiffe_id = %spiffe_id,
            alg = %alg,
            kid = %jws.header.kid,
            "JWT-SVID validated"
        );
        Ok(VerifiedIdentity { spiffe_id, claims })
    }

    fn check_registered_claims<A: AsRef<str>>(
        &self,
        claims: &Map<String, Value>,
        audience: &[A],
        now: SystemTime,
    ) -> Result<()> {
        let now = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let leeway = self.leeway.as_secs() as i64;

        let exp = numeric_date(claims, "exp")?
            .ok_or_else(|| JwtSvidError::InvalidClaims("token missing exp claim".to_string()))?;
        if now - leeway > exp {
            return Err(JwtSvidError::Expired);
        }
        if let Some(nbf) = numeric_date(claims, "nbf")? {
            if now + leeway < nbf {
                return Err(JwtSvidError::NotYetValid("nbf is in the future".to_string()));
            }
        }
        if let Some(iat) = numeric_date(claims, "iat")? {
            if now + leeway < iat {
                return Err(JwtSvidError::NotYetValid("issued in the future".to_string()));
            }
        }

        let actual = audience_claim(claims)?;
        let matched = audience
            .iter()
            .any(|expected| actual.iter().any(|aud| aud == expected.as_ref()));
        if !matched {
            return Err(JwtSvidError::AudienceMismatch {
                expected: audience.iter().map(|a| a.as_ref().to_string()).collect(),
                actual,
            });
        }
        Ok(())
    }
}

/// Validate with the default leeway.
pub fn validate_token<K, A>(token: &str, keys: &K, audience: &[A]) -> Result<VerifiedIdentity>
where
    K: KeyStore + ?Sized,
    A: AsRef<str>,
{
    JwtSvidValidator::default().validate(token, keys, audience)
}

/// NumericDate claim in whole seconds; fractional values are truncated.
fn numeric_date(claims: &Map<String, Value>, name: &str) -> Result<Option<i64>> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| JwtSvidError::InvalidClaims(format!("{name} is not a NumericDate"))),
        Some(_) => Err(JwtSvidError::InvalidClaims(format!(
            "{name} is not a NumericDate"
        ))),
    }
}

/// `aud` may be a single string or an array of strings.
fn audience_claim(claims: &Map<String, Value>) -> Result<Vec<String>> {
    match claims.get("aud") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(aud)) => Ok(vec![aud.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| JwtSvidError::InvalidClaims("aud entries must be strings".to_string()))
            })
            .collect(),
        Some(_) => Err(JwtSvidError::InvalidClaims(
            "aud must be a string or an array of strings".to_string(),
        )),
    }
}
