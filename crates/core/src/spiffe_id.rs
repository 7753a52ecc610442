//! SPIFFE identifiers and trust domains.
//!
//! A SPIFFE ID has the form `spiffe://<trust-domain>/<path>`. Parsing is
//! strict: the trust domain is restricted to lowercase letters, digits, `.`,
//! `-` and `_`; path segments to ASCII letters, digits, `.`, `-` and `_`.
//! Anything else (ports, userinfo, queries, fragments, percent-encoding,
//! empty or dot segments, trailing slashes) is rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

const SCHEME_PREFIX: &str = "spiffe://";

/// Path prefix reserved for node agent identities.
const AGENT_PATH_PREFIX: &str = "/spire/agent";

/// Administrative security boundary that owns a set of signing keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Parse a bare trust domain name (`example.org`) or its ID form
    /// (`spiffe://example.org`).
    pub fn new(name: &str) -> Result<Self> {
        let name = match name.strip_prefix(SCHEME_PREFIX) {
            Some(rest) => {
                if rest.contains('/') {
                    return Err(CoreError::InvalidTrustDomain(format!(
                        "{name:?} has a path component"
                    )));
                }
                rest
            }
            None => name,
        };
        validate_trust_domain(name).map_err(CoreError::InvalidTrustDomain)?;
        Ok(Self(name.to_string()))
    }

    /// Trust domain name, e.g. `example.org`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trust domain in SPIFFE ID form, e.g. `spiffe://example.org`.
    pub fn id_string(&self) -> String {
        format!("{SCHEME_PREFIX}{}", self.0)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.0
    }
}

/// URI-form identifier naming a workload within a trust domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Parse a SPIFFE ID from its URI string form.
    pub fn parse(id: &str) -> Result<Self> {
        let rest = id
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| CoreError::InvalidSpiffeId(format!("{id:?} lacks the spiffe scheme")))?;

        let (td, path) = match rest.find('/') {
            Some(pos) => rest.split_at(pos),
            None => (rest, ""),
        };

        validate_trust_domain(td)
            .map_err(|reason| CoreError::InvalidSpiffeId(format!("{id:?}: {reason}")))?;
        validate_path(path)
            .map_err(|reason| CoreError::InvalidSpiffeId(format!("{id:?}: {reason}")))?;

        Ok(Self {
            trust_domain: TrustDomain(td.to_string()),
            path: path.to_string(),
        })
    }

    /// Build an ID from a trust domain and an absolute path (may be empty).
    pub fn from_path(trust_domain: &TrustDomain, path: &str) -> Result<Self> {
        validate_path(path).map_err(|reason| {
            CoreError::InvalidSpiffeId(format!("path {path:?}: {reason}"))
        })?;
        Ok(Self {
            trust_domain: trust_domain.clone(),
            path: path.to_string(),
        })
    }

    /// Node agent ID: `spiffe://<td>/spire/agent<agent_path>`.
    pub fn agent_id(trust_domain: &TrustDomain, agent_path: &str) -> Result<Self> {
        if !agent_path.starts_with('/') {
            return Err(CoreError::InvalidSpiffeId(format!(
                "agent path {agent_path:?} must start with '/'"
            )));
        }
        Self::from_path(trust_domain, &format!("{AGENT_PATH_PREFIX}{agent_path}"))
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this ID names a node agent rather than a workload.
    pub fn is_agent(&self) -> bool {
        self.path
            .strip_prefix(AGENT_PATH_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}{}", self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.to_string()
    }
}

fn validate_trust_domain(td: &str) -> std::result::Result<(), String> {
    if td.is_empty() {
        return Err("trust domain is missing".to_string());
    }
    match td
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')))
    {
        Some(c) => Err(format!("trust domain contains invalid character {c:?}")),
        None => Ok(()),
    }
}

fn validate_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err("path must start with '/'".to_string());
    };
    for segment in rest.split('/') {
        match segment {
            "" => return Err("path contains an empty segment".to_string()),
            "." | ".." => return Err("path contains a dot segment".to_string()),
            _ => {}
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(format!("path contains invalid character {c:?}"));
        }
    }
    Ok(())
}
