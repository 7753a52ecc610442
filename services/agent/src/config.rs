use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;
use trustbind_core::{LogFormat, LoggingConfig, TrustDomain};
use trustbind_identity::{JwtPublicKey, TrustDomainKeyStore, ValidatorConfig};
use trustbind_peertracker::PeerTrackerConfig;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/trustbind-agent/public/api.sock";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub trust_domain: TrustDomain,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub peertracker: PeerTrackerConfig,
    #[serde(default)]
    pub jwt_svid: ValidatorConfig,
    #[serde(default)]
    pub jwt_keys: Vec<JwtKeyConfig>,
}

/// One JWT signing key from a trust bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtKeyConfig {
    /// Defaults to the agent's own trust domain; set it for federated keys
    #[serde(default)]
    pub trust_domain: Option<TrustDomain>,
    pub kid: String,
    /// PEM `PUBLIC KEY` file, relative paths resolve against the config file
    pub public_key_path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_log_level() -> String {
    LoggingConfig::default().level
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: AgentConfig = trustbind_core::config::load_toml(path)?;
        if let Some(dir) = path.parent() {
            for key in &mut config.jwt_keys {
                if key.public_key_path.is_relative() {
                    key.public_key_path = dir.join(&key.public_key_path);
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.peertracker.validate()?;

        let mut seen = HashSet::new();
        for (i, key) in self.jwt_keys.iter().enumerate() {
            if key.kid.is_empty() {
                bail!("jwt_keys[{i}] has an empty kid");
            }
            let trust_domain = self.key_trust_domain(key);
            if !seen.insert((trust_domain, key.kid.as_str())) {
                bail!("jwt_keys[{i}] repeats kid {:?} for trust domain {trust_domain}", key.kid);
            }
        }
        if !self.jwt_keys.is_empty() && !seen.iter().any(|(td, _)| *td == &self.trust_domain) {
            bail!(
                "jwt_keys has no key for the agent's trust domain {}",
                self.trust_domain
            );
        }
        Ok(())
    }

    fn key_trust_domain<'a>(&'a self, key: &'a JwtKeyConfig) -> &'a TrustDomain {
        key.trust_domain.as_ref().unwrap_or(&self.trust_domain)
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            format: self.log_format,
            level: self.log_level.clone(),
        }
    }

    /// Read every configured key into a fresh key set.
    pub fn load_key_store(&self) -> anyhow::Result<TrustDomainKeyStore> {
        let mut store = TrustDomainKeyStore::new();
        for key in &self.jwt_keys {
            let pem = std::fs::read_to_string(&key.public_key_path).with_context(|| {
                format!("failed to read JWT key {:?} from {}", key.kid, key.public_key_path.display())
            })?;
            let public_key = JwtPublicKey::from_public_key_pem(&pem)
                .with_context(|| format!("invalid JWT key {:?}", key.kid))?;
            store.insert(self.key_trust_domain(key).clone(), key.kid.clone(), public_key);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trustbind_identity::KeyStore;

    const EC_PUB: &str = include_str!("../../../crates/identity/testdata/ec-pub.pem");

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: AgentConfig =
            trustbind_core::config::from_toml_str(r#"trust_domain = "example.org""#).unwrap();
        assert_eq!(config.trust_domain.as_str(), "example.org");
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.logging(), LoggingConfig::default());
        assert_eq!(config.peertracker, PeerTrackerConfig::default());
        assert!(config.jwt_keys.is_empty());
    }

    #[test]
    fn test_load_resolves_relative_key_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k1.pem"), EC_PUB).unwrap();

        let config_path = dir.path().join("agent.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        write!(
            file,
            r#"
trust_domain = "example.org"
socket_path = "/run/trustbind/api.sock"
log_format = "json"
log_level = "debug"

[peertracker]
resolution_timeout_ms = 1000

[jwt_svid]
leeway_secs = 10

[[jwt_keys]]
trust_domain = "example.org"
kid = "k1"
public_key_path = "k1.pem"
"#
        )
        .unwrap();

        let config = AgentConfig::load(&config_path).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.peertracker.resolution_timeout_ms, 1000);
        assert_eq!(config.jwt_svid.leeway_secs, 10);
        assert_eq!(config.jwt_keys[0].public_key_path, dir.path().join("k1.pem"));

        let store = config.load_key_store().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let config: AgentConfig = trustbind_core::config::from_toml_str(
            r#"
trust_domain = "example.org"
[peertracker]
liveness_poll_interval_ms = 0
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let bad_td = trustbind_core::config::from_toml_str::<AgentConfig>(r#"trust_domain = "Example.ORG""#);
        assert!(bad_td.is_err());
    }

    #[test]
    fn test_keys_default_to_agent_trust_domain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k1.pem"), EC_PUB).unwrap();
        let config: AgentConfig = trustbind_core::config::from_toml_str(&format!(
            r#"
trust_domain = "example.org"
[[jwt_keys]]
kid = "k1"
public_key_path = "{}"
[[jwt_keys]]
trust_domain = "partner.org"
kid = "k1"
public_key_path = "{}"
"#,
            dir.path().join("k1.pem").display(),
            dir.path().join("k1.pem").display()
        ))
        .unwrap();
        config.validate().unwrap();

        let store = config.load_key_store().unwrap();
        let example = TrustDomain::new("example.org").unwrap();
        let partner = TrustDomain::new("partner.org").unwrap();
        assert!(store.find_public_key(&example, "k1").is_ok());
        assert!(store.find_public_key(&partner, "k1").is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_key_set_must_cover_agent_trust_domain() {
        let only_federated: AgentConfig = trustbind_core::config::from_toml_str(
            r#"
trust_domain = "example.org"
[[jwt_keys]]
trust_domain = "partner.org"
kid = "k1"
public_key_path = "/etc/trustbind/partner.pem"
"#,
        )
        .unwrap();
        let err = only_federated.validate().unwrap_err();
        assert!(err.to_string().contains("example.org"), "{err}");

        let duplicated: AgentConfig = trustbind_core::config::from_toml_str(
            r#"
trust_domain = "example.org"
[[jwt_keys]]
kid = "k1"
public_key_path = "/etc/trustbind/a.pem"
[[jwt_keys]]
trust_domain = "example.org"
kid = "k1"
public_key_path = "/etc/trustbind/b.pem"
"#,
        )
        .unwrap();
        let err = duplicated.validate().unwrap_err();
        assert!(err.to_string().contains("repeats"), "{err}");
    }

    #[test]
    fn test_missing_key_file_reported() {
        let config: AgentConfig = trustbind_core::config::from_toml_str(
            r#"
trust_domain = "example.org"
[[jwt_keys]]
trust_domain = "example.org"
kid = "k1"
public_key_path = "/nonexistent/k1.pem"
"#,
        )
        .unwrap();
        let err = config.load_key_store().unwrap_err();
        assert!(err.to_string().contains("k1"));
    }
}
