//! Scripted [`RemoteExec`] for tests.
//!
//! Commands succeed with empty output unless a rule matches. Rules match
//! by substring, first match wins, and may be limited to a number of uses
//! so that "fails twice, then works" sequences can be expressed.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::RemoteResult;
use crate::exec::{CommandOutput, RemoteExec};

/// A call observed by [`ScriptedExec`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Run { address: IpAddr, command: String },
    Capture { address: IpAddr, command: String },
    Interactive { address: IpAddr, command: Option<String> },
    CopyTo { address: IpAddr, local: PathBuf, remote: String, as_root: bool },
    CopyFrom { address: IpAddr, remote: String, local: PathBuf, as_root: bool },
}

impl RemoteCall {
    pub fn address(&self) -> IpAddr {
        match self {
            RemoteCall::Run { address, .. }
            | RemoteCall::Capture { address, .. }
            | RemoteCall::Interactive { address, .. }
            | RemoteCall::CopyTo { address, .. }
            | RemoteCall::CopyFrom { address, .. } => *address,
        }
    }

    /// The command text, for command-style calls.
    pub fn command(&self) -> Option<&str> {
        match self {
            RemoteCall::Run { command, .. } | RemoteCall::Capture { command, .. } => Some(command),
            RemoteCall::Interactive { command, .. } => command.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    address: Option<IpAddr>,
    exit_code: i32,
    stdout: String,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    hangs: Vec<String>,
    calls: Vec<RemoteCall>,
}

#[derive(Debug, Default)]
pub struct ScriptedExec {
    state: Mutex<State>,
}

impl ScriptedExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command containing `pattern` exits with `exit_code`.
    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str) {
        self.push_rule(pattern, None, exit_code, stdout, None);
    }

    /// The next `times` commands containing `pattern` exit with `exit_code`.
    pub fn respond_times(&self, pattern: &str, exit_code: i32, times: u32) {
        self.push_rule(pattern, None, exit_code, "", Some(times));
    }

    /// Like [`respond`](Self::respond) but only for one address.
    pub fn respond_at(&self, address: IpAddr, pattern: &str, exit_code: i32, stdout: &str) {
        self.push_rule(pattern, Some(address), exit_code, stdout, None);
    }

    /// Commands containing `pattern` never return, like ssh to a dead host.
    pub fn hang(&self, pattern: &str) {
        self.lock().hangs.push(pattern.to_string());
    }

    fn push_rule(
        &self,
        pattern: &str,
        address: Option<IpAddr>,
        exit_code: i32,
        stdout: &str,
        remaining: Option<u32>,
    ) {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            address,
            exit_code,
            stdout: stdout.to_string(),
            remaining,
        });
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Command calls whose text contains `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<RemoteCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.command().is_some_and(|cmd| cmd.contains(pattern)))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn hang_if_scripted(&self, command: &str) {
        let hangs = self.lock().hangs.iter().any(|p| command.contains(p.as_str()));
        if hangs {
            std::future::pending::<()>().await;
        }
    }

    fn answer(&self, call: RemoteCall) -> CommandOutput {
        let mut state = self.lock();
        let address = call.address();
        let command = call.command().unwrap_or_default().to_string();
        state.calls.push(call);

        let rule = state.rules.iter_mut().find(|r| {
            command.contains(r.pattern.as_str())
                && r.address.is_none_or(|a| a == address)
                && r.remaining != Some(0)
        });
        match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                CommandOutput {
                    exit_code: rule.exit_code,
                    stdout: rule.stdout.clone(),
                    stderr: String::new(),
                }
            }
            None => CommandOutput::default(),
        }
    }
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn run(&self, address: IpAddr, command: &str) -> RemoteResult<i32> {
        let call = RemoteCall::Run {
            address,
            command: command.to_string(),
        };
        let output = self.answer(call);
        self.hang_if_scripted(command).await;
        Ok(output.exit_code)
    }

    async fn run_capture(&self, address: IpAddr, command: &str) -> RemoteResult<CommandOutput> {
        let call = RemoteCall::Capture {
            address,
            command: command.to_string(),
        };
        let output = self.answer(call);
        self.hang_if_scripted(command).await;
        Ok(output)
    }

    async fn interactive(&self, address: IpAddr, command: Option<&str>) -> RemoteResult<i32> {
        let call = RemoteCall::Interactive {
            address,
            command: command.map(str::to_string),
        };
        Ok(self.answer(call).exit_code)
    }

    async fn copy_to(
        &self,
        address: IpAddr,
        local: &Path,
        remote: &str,
        as_root: bool,
    ) -> RemoteResult<()> {
        self.lock().calls.push(RemoteCall::CopyTo {
            address,
            local: local.to_path_buf(),
            remote: remote.to_string(),
            as_root,
        });
        Ok(())
    }

    async fn copy_from(
        &self,
        address: IpAddr,
        remote: &str,
        local: &Path,
        as_root: bool,
    ) -> RemoteResult<()> {
        self.lock().calls.push(RemoteCall::CopyFrom {
            address,
            remote: remote.to_string(),
            local: local.to_path_buf(),
            as_root,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "192.168.1.20".parse().unwrap()
    }

    #[tokio::test]
    async fn defaults_to_success() {
        let exec = ScriptedExec::new();
        assert_eq!(exec.run(addr(), "true").await.unwrap(), 0);
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn limited_rule_expires() {
        let exec = ScriptedExec::new();
        exec.respond_times("true", 255, 2);
        assert_eq!(exec.run(addr(), "true").await.unwrap(), 255);
        assert_eq!(exec.run(addr(), "true").await.unwrap(), 255);
        assert_eq!(exec.run(addr(), "true").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn capture_returns_scripted_stdout() {
        let exec = ScriptedExec::new();
        exec.respond("token create", 0, "kubeadm join x\n");
        let output = exec.run_capture(addr(), "sudo kubeadm token create").await.unwrap();
        assert_eq!(output.text(), "kubeadm join x");
        assert_eq!(exec.commands_matching("token").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_is_recorded_but_never_returns() {
        let exec = ScriptedExec::new();
        exec.hang("is-system-running");
        let run = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            exec.run(addr(), "systemctl is-system-running --wait"),
        )
        .await;
        assert!(run.is_err());
        assert_eq!(exec.commands_matching("is-system-running").len(), 1);
        assert_eq!(exec.run(addr(), "true").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn address_rule_only_matches_its_address() {
        let exec = ScriptedExec::new();
        exec.respond_at(addr(), "true", 1, "");
        let other: IpAddr = "192.168.1.21".parse().unwrap();
        assert_eq!(exec.run(other, "true").await.unwrap(), 0);
        assert_eq!(exec.run(addr(), "true").await.unwrap(), 1);
    }
}
