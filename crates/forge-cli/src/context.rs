//! Wiring shared by every subcommand: config, hypervisor client, remote
//! execution, cancellation and the provisioner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{debug, info, warn};

use forge_core::{CancelSignal, ForgeConfig, cancel_pair};
use forge_hypervisor::ProxmoxClient;
use forge_machine::Machine;
use forge_provision::Provisioner;
use forge_remote::SshExec;

const CONFIG_ENV: &str = "FORGE_CONFIG";
const DEFAULT_CONFIG: &str = "forge.toml";

pub struct Context {
    pub provisioner: Arc<Provisioner>,
    pub cancel: CancelSignal,
}

impl Context {
    pub async fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let config = load_config(explicit, std::env::var(CONFIG_ENV).ok())?;

        let password = config
            .hypervisor
            .resolve_password()
            .context("resolving the hypervisor password")?;
        let gateway = ProxmoxClient::connect(&config.hypervisor, password)
            .await
            .with_context(|| format!("connecting to {}", config.hypervisor.api_host))?;
        let remote = SshExec::from_config(&config.ssh);

        let (handle, cancel) = cancel_pair();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, aborting...");
                handle.cancel();
            }
        });

        let provisioner = Provisioner::new(
            Arc::new(gateway),
            Arc::new(remote),
            &config,
            cancel.clone(),
        )?;
        Ok(Self {
            provisioner: Arc::new(provisioner),
            cancel,
        })
    }

    /// Resolve a name as a VM or a network host.
    pub async fn resolve(&self, name: &str) -> anyhow::Result<Machine> {
        Ok(self.provisioner.resolver().resolve(name).await?)
    }

    /// Resolve either a VM id or a name.
    pub async fn resolve_by(&self, by_id: bool, name: &str) -> anyhow::Result<Machine> {
        if by_id {
            let id = name.parse().with_context(|| format!("{name:?} is not a VM id"))?;
            Ok(self.provisioner.resolver().resolve_id(id).await?)
        } else {
            self.resolve(name).await
        }
    }
}

/// Which config file to read, if any.
///
/// An explicit path or `$FORGE_CONFIG` must exist; `./forge.toml` is
/// optional.
fn config_path(explicit: Option<&Path>, env: Option<String>) -> (PathBuf, bool) {
    if let Some(path) = explicit {
        return (path.to_path_buf(), true);
    }
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return (PathBuf::from(path), true);
    }
    (PathBuf::from(DEFAULT_CONFIG), false)
}

fn load_config(explicit: Option<&Path>, env: Option<String>) -> anyhow::Result<ForgeConfig> {
    let (path, required) = config_path(explicit, env);
    if !required && !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(ForgeConfig::default());
    }
    let config = ForgeConfig::from_file(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    debug!(path = %path.display(), "config ready");
    Ok(config)
}
