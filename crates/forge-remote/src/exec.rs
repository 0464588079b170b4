use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;

use crate::error::RemoteResult;

/// Result of a command run with captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with surrounding whitespace removed.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Command execution and file transfer against a network address.
///
/// Commands are shell strings interpreted by the remote login shell. A
/// command that ran and exited non-zero is `Ok` with that code; `Err` is
/// reserved for failing to run it at all.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run a command and wait for it; returns the exit code.
    async fn run(&self, address: IpAddr, command: &str) -> RemoteResult<i32>;

    /// Run a command and capture its output.
    async fn run_capture(&self, address: IpAddr, command: &str) -> RemoteResult<CommandOutput>;

    /// Attach the local terminal to a shell, or to `command` when given.
    async fn interactive(&self, address: IpAddr, command: Option<&str>) -> RemoteResult<i32>;

    /// Recursively copy a local path to `remote` on the node.
    async fn copy_to(
        &self,
        address: IpAddr,
        local: &Path,
        remote: &str,
        as_root: bool,
    ) -> RemoteResult<()>;

    /// Recursively copy `remote` from the node to a local path.
    async fn copy_from(
        &self,
        address: IpAddr,
        remote: &str,
        local: &Path,
        as_root: bool,
    ) -> RemoteResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_text_is_trimmed() {
        let output = CommandOutput {
            exit_code: 0,
            stdout: "  kubeadm join 10.0.0.1:6443 --token abc\n".to_string(),
            stderr: String::new(),
        };
        assert!(output.success());
        assert_eq!(output.text(), "kubeadm join 10.0.0.1:6443 --token abc");
    }
}
