//! Configurable server-side node attestors.
//!
//! An attestor starts unconfigured. `configure` decodes TOML into the
//! binding's server configuration, builds an immutable server snapshot and
//! publishes it; handshakes started afterwards use that snapshot for their
//! whole lifetime. Starting a handshake while unconfigured is a precondition
//! error.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{error, info};
use trustbind_core::{ConfigCell, SpiffeId};

use crate::error::Result;
use crate::{sshpop, x509pop};

/// Verifier side of one proof-of-possession attempt.
pub trait PopHandshake: Send {
    fn verify_attestation_data(&mut self, data: &[u8]) -> Result<()>;

    fn issue_challenge(&mut self) -> Result<Vec<u8>>;

    fn verify_challenge_response(&mut self, response: &[u8]) -> Result<()>;

    /// Agent ID of the attested node; only after the response verified.
    fn agent_id(&self) -> Result<SpiffeId>;
}

/// A binding's immutable server configuration.
pub trait PopServer: Send + Sync + Sized + 'static {
    const PLUGIN_NAME: &'static str;

    type Config: DeserializeOwned;
    type Handshake: PopHandshake;

    fn from_config(trust_domain: &str, config: &Self::Config) -> Result<Self>;

    fn new_handshake(server: Arc<Self>) -> Self::Handshake;
}

pub struct Attestor<S> {
    cell: ConfigCell<S>,
}

pub type X509PopAttestor = Attestor<x509pop::Server>;
pub type SshPopAttestor = Attestor<sshpop::Server>;

impl<S: PopServer> Attestor<S> {
    pub fn new() -> Self {
        Self {
            cell: ConfigCell::new(S::PLUGIN_NAME),
        }
    }

    /// Apply a TOML configuration. On failure the previous snapshot (or the
    /// unconfigured state) is kept.
    pub fn configure(&self, trust_domain: &str, config: &str) -> Result<()> {
        let config: S::Config = trustbind_core::config::from_toml_str(config)?;
        let server = S::from_config(trust_domain, &config).inspect_err(|e| {
            error!(plugin = S::PLUGIN_NAME, error = %e, "rejected attestor configuration");
        })?;
        let replaced = self.cell.configure(server).is_some();
        info!(plugin = S::PLUGIN_NAME, trust_domain, replaced, "attestor configured");
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.cell.is_configured()
    }

    pub fn new_handshake(&self) -> Result<S::Handshake> {
        Ok(S::new_handshake(self.cell.load()?))
    }
}

impl<S: PopServer> Default for Attestor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl PopServer for x509pop::Server {
    const PLUGIN_NAME: &'static str = x509pop::PLUGIN_NAME;

    type Config = x509pop::ServerConfig;
    type Handshake = x509pop::ServerHandshake;

    fn from_config(trust_domain: &str, config: &Self::Config) -> Result<Self> {
        x509pop::Server::new(trust_domain, config)
    }

    fn new_handshake(server: Arc<Self>) -> Self::Handshake {
        x509pop::ServerHandshake::new(server)
    }
}

impl PopServer for sshpop::Server {
    const PLUGIN_NAME: &'static str = sshpop::PLUGIN_NAME;

    type Config = sshpop::ServerConfig;
    type Handshake = sshpop::ServerHandshake;

    fn from_config(trust_domain: &str, config: &Self::Config) -> Result<Self> {
        sshpop::Server::new(trust_domain, config)
    }

    fn new_handshake(server: Arc<Self>) -> Self::Handshake {
        sshpop::ServerHandshake::new(server)
    }
}

impl PopHandshake for x509pop::ServerHandshake {
    fn verify_attestation_data(&mut self, data: &[u8]) -> Result<()> {
        x509pop::ServerHandshake::verify_attestation_data(self, data)
    }

    fn issue_challenge(&mut self) -> Result<Vec<u8>> {
        x509pop::ServerHandshake::issue_challenge(self)
    }

    fn verify_challenge_response(&mut self, response: &[u8]) -> Result<()> {
        x509pop::ServerHandshake::verify_challenge_response(self, response)
    }

    fn agent_id(&self) -> Result<SpiffeId> {
        x509pop::ServerHandshake::agent_id(self)
    }
}

impl PopHandshake for sshpop::ServerHandshake {
    fn verify_attestation_data(&mut self, data: &[u8]) -> Result<()> {
        sshpop::ServerHandshake::verify_attestation_data(self, data)
    }

    fn issue_challenge(&mut self) -> Result<Vec<u8>> {
        sshpop::ServerHandshake::issue_challenge(self)
    }

    fn verify_challenge_response(&mut self, response: &[u8]) -> Result<()> {
        sshpop::ServerHandshake::verify_challenge_response(self, response)
    }

    fn agent_id(&self) -> Result<SpiffeId> {
        sshpop::ServerHandshake::agent_id(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PopError;
    use trustbind_core::CoreError;

    const CA: &str = include_str!("../testdata/ssh-ca.pub");

    fn ssh_config(template: &str) -> String {
        format!(
            "cert_authorities = [{:?}]\nagent_path_template = {:?}\n",
            CA.trim(),
            template
        )
    }

    #[test]
    fn test_unconfigured_attestor_refuses_handshakes() {
        let attestor = SshPopAttestor::new();
        assert!(!attestor.is_configured());
        let err = attestor.new_handshake().err().unwrap();
        assert!(matches!(err, PopError::Core(CoreError::Unconfigured("sshpop"))));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_configure_from_toml() {
        let attestor = SshPopAttestor::new();
        attestor
            .configure("example.org", &ssh_config("/{{ PluginName }}/{{ Hostname }}"))
            .unwrap();
        assert!(attestor.is_configured());
        attestor.new_handshake().unwrap();

        let x509 = X509PopAttestor::default();
        x509.configure("example.org", "").unwrap();
        x509.new_handshake().unwrap();
    }

    #[test]
    fn test_invalid_configuration_keeps_state() {
        let attestor = SshPopAttestor::new();
        assert!(attestor
            .configure("example.org", "cert_authorities = 7")
            .unwrap_err()
            .is_configuration());
        assert!(attestor.configure("example.org", "").unwrap_err().is_configuration());
        assert!(!attestor.is_configured());

        attestor
            .configure("example.org", &ssh_config("/{{ Fingerprint }}"))
            .unwrap();
        assert!(attestor
            .configure("example.org", &ssh_config("{{#each}}"))
            .is_err());
        assert!(attestor.is_configured());
    }

    #[test]
    fn test_handshake_keeps_snapshot_across_reconfigure() {
        let client = x509pop::Client::from_pem(
            include_str!("../testdata/ec-cert.pem"),
            include_str!("../testdata/ec-key.pem"),
        )
        .unwrap();
        let attestor = X509PopAttestor::new();
        attestor.configure("example.org", "").unwrap();
        let mut handshake = attestor.new_handshake().unwrap();

        handshake
            .verify_attestation_data(&client.attestation_data().unwrap())
            .unwrap();
        attestor.configure("other.org", "").unwrap();
        let challenge = handshake.issue_challenge().unwrap();
        handshake
            .verify_challenge_response(&client.respond_to_challenge(&challenge).unwrap())
            .unwrap();

        let id = handshake.agent_id().unwrap();
        assert_eq!(id.trust_domain().as_str(), "example.org");

        let fresh = attestor.new_handshake().unwrap();
        assert!(fresh.agent_id().is_err());
    }
}
