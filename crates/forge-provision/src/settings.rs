//! Resolved provisioning settings.

use std::path::PathBuf;
use std::time::Duration;

use forge_core::ConfigResult;
use forge_core::config::{PayloadStep, ProvisionConfig};

/// Where the init script is placed on the node.
pub const INIT_SCRIPT_PATH: &str = "/tmp/init.sh";

/// Where a post-init script is placed on the node.
pub const POST_INIT_PATH: &str = "/tmp/post-init-script";

/// [`ProvisionConfig`] with durations parsed.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub init_script: PathBuf,
    pub accepted_exit_codes: Vec<i32>,
    pub reboot_grace: Duration,
    pub launch_stagger: Duration,
    pub master_post_init_script: Option<PathBuf>,
    pub payload: Vec<PayloadStep>,
}

impl ProvisionSettings {
    pub fn from_config(config: &ProvisionConfig) -> ConfigResult<Self> {
        Ok(Self {
            init_script: config.init_script.clone(),
            accepted_exit_codes: config.init_accepted_exit_codes.clone(),
            reboot_grace: config.reboot_grace()?,
            launch_stagger: config.launch_stagger()?,
            master_post_init_script: config.master_post_init_script.clone(),
            payload: config.payload.clone(),
        })
    }

    pub fn accepts_init_exit(&self, code: i32) -> bool {
        self.accepted_exit_codes.contains(&code)
    }
}

/// Command that runs the init script for node `name`.
pub fn init_command(name: &str) -> String {
    format!("bash {INIT_SCRIPT_PATH} {name}")
}

/// Command that runs an uploaded post-init script.
pub fn post_init_command() -> String {
    format!("sudo chmod +x {POST_INIT_PATH} && {POST_INIT_PATH}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_accept_reboot_exit() {
        let settings = ProvisionSettings::from_config(&ProvisionConfig::default()).unwrap();
        for code in [0, 1, 255] {
            assert!(settings.accepts_init_exit(code));
        }
        assert!(!settings.accepts_init_exit(17));
        assert_eq!(settings.launch_stagger, Duration::from_secs(3));
        assert_eq!(settings.reboot_grace, Duration::from_secs(1));
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let config = ProvisionConfig {
            reboot_grace: "soon".to_string(),
            ..ProvisionConfig::default()
        };
        assert!(ProvisionSettings::from_config(&config).is_err());
    }

    #[test]
    fn commands() {
        assert_eq!(init_command("kb1"), "bash /tmp/init.sh kb1");
        assert_eq!(
            post_init_command(),
            "sudo chmod +x /tmp/post-init-script && /tmp/post-init-script"
        );
    }
}
