//! forge.toml configuration parser.
//!
//! Every section is optional; defaults mirror a two-host lab cluster with
//! templates cloned into the `500..1000` id band.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::network::HomeNetwork;
use crate::types::{ProtectedRanges, VmId};

/// Environment variable overriding the hypervisor password.
pub const PASSWORD_ENV: &str = "FORGE_HYPERVISOR_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub hypervisor: HypervisorConfig,
    pub ids: IdsConfig,
    pub network: NetworkConfig,
    pub ssh: SshConfig,
    pub readiness: ReadinessConfig,
    pub provision: ProvisionConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub api_host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Command whose trimmed stdout is the password, e.g. `["ssh", "root@pve", "cat", "passwd"]`.
    pub password_command: Option<Vec<String>>,
    pub verify_tls: bool,
    /// Host name → template VM id cloned on that host.
    pub templates: BTreeMap<String, VmId>,
    pub request_timeout: String,
    pub task_poll_interval: String,
    pub task_timeout: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            api_host: "localhost".to_string(),
            port: 8006,
            user: "root@pam".to_string(),
            password: None,
            password_command: None,
            verify_tls: false,
            templates: BTreeMap::new(),
            request_timeout: "30s".to_string(),
            task_poll_interval: "300ms".to_string(),
            task_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdsConfig {
    pub protected_below: VmId,
    pub protected_from: VmId,
    pub scan_start: VmId,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            protected_below: 500,
            protected_from: 1000,
            scan_start: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub home: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            home: vec!["192.168.1.0/24".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    /// Extra options passed to every ssh invocation.
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "forge".to_string(),
            options: vec![
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "ConnectTimeout=10".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub poll_interval: String,
    /// Upper bound for each readiness stage.
    pub stage_timeout: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: "300ms".to_string(),
            stage_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub init_script: PathBuf,
    /// Init-script exit codes that do not abort provisioning.
    pub init_accepted_exit_codes: Vec<i32>,
    /// Pause after the init script before polling readiness again.
    pub reboot_grace: String,
    /// Delay between consecutive node launches in a cluster fan-out.
    pub launch_stagger: String,
    /// Post-init script run on the first node of a cluster.
    pub master_post_init_script: Option<PathBuf>,
    pub payload: Vec<PayloadStep>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            init_script: PathBuf::from("install-scripts/general-init.sh"),
            init_accepted_exit_codes: vec![0, 1, 255],
            reboot_grace: "1s".to_string(),
            launch_stagger: "3s".to_string(),
            master_post_init_script: None,
            payload: Vec::new(),
        }
    }
}

/// A directory synced to every node after initialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadStep {
    pub source: PathBuf,
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub as_root: bool,
    /// Command run once the sync finished.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Run on the master; prints the join command.
    pub token_command: String,
    /// Appended to the join command as `--cri-socket=<value>`.
    pub transport_socket: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            token_command: "sudo kubeadm token create --print-join-command".to_string(),
            transport_socket: "unix:///var/run/cri-dockerd.sock".to_string(),
        }
    }
}

impl ForgeConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        debug!(?path, "config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: ForgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check cross-field constraints and that every duration parses.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.ids.protected_below >= self.ids.protected_from {
            return Err(ConfigError::Invalid(format!(
                "ids.protected_below ({}) must be lower than ids.protected_from ({})",
                self.ids.protected_below, self.ids.protected_from
            )));
        }
        if self.network.home.is_empty() {
            return Err(ConfigError::Invalid(
                "network.home must list at least one network".to_string(),
            ));
        }
        self.home_networks()?;
        self.hypervisor.request_timeout()?;
        self.hypervisor.task_poll_interval()?;
        self.hypervisor.task_timeout()?;
        self.readiness.poll_interval()?;
        self.readiness.stage_timeout()?;
        self.provision.reboot_grace()?;
        self.provision.launch_stagger()?;
        Ok(())
    }

    pub fn protected_ranges(&self) -> ProtectedRanges {
        ProtectedRanges::new(self.ids.protected_below, self.ids.protected_from)
    }

    pub fn home_networks(&self) -> ConfigResult<Vec<HomeNetwork>> {
        self.network.home.iter().map(|s| s.parse()).collect()
    }
}

impl HypervisorConfig {
    pub fn request_timeout(&self) -> ConfigResult<Duration> {
        duration_field("hypervisor.request_timeout", &self.request_timeout)
    }

    pub fn task_poll_interval(&self) -> ConfigResult<Duration> {
        duration_field("hypervisor.task_poll_interval", &self.task_poll_interval)
    }

    pub fn task_timeout(&self) -> ConfigResult<Duration> {
        duration_field("hypervisor.task_timeout", &self.task_timeout)
    }

    /// Resolve the API password: environment, then config value, then command.
    pub fn resolve_password(&self) -> ConfigResult<String> {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            return Ok(password);
        }
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        let Some(command) = &self.password_command else {
            return Err(ConfigError::MissingPassword);
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ConfigError::PasswordCommand("empty command".to_string()))?;
        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ConfigError::PasswordCommand(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(ConfigError::PasswordCommand(format!(
                "{program} exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> ConfigResult<Duration> {
        duration_field("readiness.poll_interval", &self.poll_interval)
    }

    pub fn stage_timeout(&self) -> ConfigResult<Duration> {
        duration_field("readiness.stage_timeout", &self.stage_timeout)
    }
}

impl ProvisionConfig {
    pub fn reboot_grace(&self) -> ConfigResult<Duration> {
        duration_field("provision.reboot_grace", &self.reboot_grace)
    }

    pub fn launch_stagger(&self) -> ConfigResult<Duration> {
        duration_field("provision.launch_stagger", &self.launch_stagger)
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "300ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
