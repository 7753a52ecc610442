//! Trustbind agent: serves JWT-SVID validation to attested local workloads.

mod config;
mod workload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trustbind_identity::{JwtSvidValidator, KeyStoreHandle};
use trustbind_peertracker::{AttestedListener, ProcessTracker};

use crate::config::AgentConfig;
use crate::workload::WorkloadApi;

const AGENT_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct AgentVersion {
    version: &'static str,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let version = AgentVersion {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: AGENT_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&version)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = AgentConfig::load(&config_path)?;
    trustbind_core::logging::init_with(&config.logging());

    if let Err(e) = run(config, &config_path).await {
        error!(error = %format!("{e:#}"), "agent failed");
        return Err(e);
    }
    Ok(())
}

async fn run(config: AgentConfig, config_path: &Path) -> anyhow::Result<()> {
    let keys = Arc::new(KeyStoreHandle::with_keys(config.load_key_store()?));
    let tracker = Arc::new(ProcessTracker::with_procfs(config.peertracker.clone())?);

    if let Some(dir) = config.socket_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create socket directory {}", dir.display()))?;
    }
    let listener = AttestedListener::bind(&config.socket_path, tracker)?;

    info!(
        trust_domain = %config.trust_domain,
        socket = %config.socket_path.display(),
        jwt_keys = config.jwt_keys.len(),
        "trustbind agent started"
    );

    let api = Arc::new(WorkloadApi::new(JwtSvidValidator::new(&config.jwt_svid), keys));
    let shutdown = CancellationToken::new();

    let reload = tokio::spawn(reload_keys_on_hangup(
        config_path.to_path_buf(),
        Arc::clone(&api),
        shutdown.clone(),
    ));

    let handler_api = Arc::clone(&api);
    let server = tokio::spawn(listener.serve(shutdown.clone(), move |stream| {
        let api = Arc::clone(&handler_api);
        async move { api.serve_connection(stream).await }
    }));

    wait_for_shutdown().await?;
    info!("shutdown requested");
    shutdown.cancel();

    server.await.context("listener task failed")?;
    reload.await.context("key reload task failed")?;
    info!("trustbind agent stopped");
    Ok(())
}

/// Re-read the JWT keys named in the config file on SIGHUP and publish
/// them as one new key set. A bad reload keeps the current keys.
async fn reload_keys_on_hangup(config_path: PathBuf, api: Arc<WorkloadApi>, shutdown: CancellationToken) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable; key reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }

        match AgentConfig::load(&config_path).and_then(|config| config.load_key_store()) {
            Ok(keys) => {
                let count = keys.len();
                api.keys().refresh(keys);
                info!(jwt_keys = count, "JWT keys reloaded");
            }
            Err(e) => warn!(error = %format!("{e:#}"), "JWT key reload failed; keeping current keys"),
        }
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_config_path() {
        let path = parse_config_path(&args(&["trustbind-agent", "--config", "/etc/agent.toml"])).unwrap();
        assert_eq!(path, PathBuf::from("/etc/agent.toml"));

        assert!(parse_config_path(&args(&["trustbind-agent", "--config"])).is_err());
        assert!(parse_config_path(&args(&["trustbind-agent"])).is_err());
    }
}
