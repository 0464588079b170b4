//! [`RemoteExec`] over the system `ssh` and `rsync` binaries.

use std::net::IpAddr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use forge_core::config::SshConfig;

use crate::error::{RemoteError, RemoteResult};
use crate::exec::{CommandOutput, RemoteExec};

/// Runs commands through `ssh <options> <user>@<address> <command>`.
#[derive(Debug, Clone)]
pub struct SshExec {
    user: String,
    options: Vec<String>,
    ssh_program: String,
    rsync_program: String,
}

impl SshExec {
    pub fn new(user: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            user: user.into(),
            options,
            ssh_program: "ssh".to_string(),
            rsync_program: "rsync".to_string(),
        }
    }

    pub fn from_config(config: &SshConfig) -> Self {
        Self::new(config.user.clone(), config.options.clone())
    }

    /// Override the binaries, e.g. to point at wrappers.
    pub fn with_programs(mut self, ssh: impl Into<String>, rsync: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.rsync_program = rsync.into();
        self
    }

    fn ssh_args(&self, address: IpAddr, tty: bool, command: Option<&str>) -> Vec<String> {
        let mut args = self.options.clone();
        if tty {
            args.push("-t".to_string());
        }
        args.push(format!("{}@{}", self.user, address));
        if let Some(command) = command {
            args.push(command.to_string());
        }
        args
    }

    /// `user@host:path` as rsync expects it; IPv6 literals need brackets.
    fn remote_spec(&self, address: IpAddr, path: &str) -> String {
        match address {
            IpAddr::V4(v4) => format!("{}@{}:{}", self.user, v4, path),
            IpAddr::V6(v6) => format!("{}@[{}]:{}", self.user, v6, path),
        }
    }

    fn rsync_args(&self, from: String, to: String, as_root: bool) -> Vec<String> {
        let mut shell = vec![self.ssh_program.clone()];
        shell.extend(self.options.iter().cloned());
        let mut args = vec!["-e".to_string(), shell.join(" "), "-r".to_string()];
        if as_root {
            args.push("--rsync-path=sudo rsync".to_string());
        }
        args.push(from);
        args.push(to);
        args
    }

    async fn rsync(&self, from: String, to: String, as_root: bool) -> RemoteResult<()> {
        let args = self.rsync_args(from.clone(), to.clone(), as_root);
        debug!(?args, "rsync");
        let status = Command::new(&self.rsync_program)
            .args(&args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| self.spawn_error(&self.rsync_program, source))?;
        let exit_code = exit_code(&self.rsync_program, status)?;
        debug!(exit_code, "rsync finished");
        if exit_code != 0 {
            return Err(RemoteError::Transfer {
                from,
                to,
                exit_code,
            });
        }
        Ok(())
    }

    fn spawn_error(&self, program: &str, source: std::io::Error) -> RemoteError {
        RemoteError::Spawn {
            program: program.to_string(),
            source,
        }
    }
}

fn exit_code(program: &str, status: ExitStatus) -> RemoteResult<i32> {
    status.code().ok_or_else(|| RemoteError::Signalled {
        program: program.to_string(),
    })
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn run(&self, address: IpAddr, command: &str) -> RemoteResult<i32> {
        debug!(%address, %command, "ssh run");
        let status = Command::new(&self.ssh_program)
            .args(self.ssh_args(address, false, Some(command)))
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| self.spawn_error(&self.ssh_program, source))?;
        exit_code(&self.ssh_program, status)
    }

    async fn run_capture(&self, address: IpAddr, command: &str) -> RemoteResult<CommandOutput> {
        debug!(%address, %command, "ssh capture");
        let output = Command::new(&self.ssh_program)
            .args(self.ssh_args(address, false, Some(command)))
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| self.spawn_error(&self.ssh_program, source))?;
        Ok(CommandOutput {
            exit_code: exit_code(&self.ssh_program, output.status)?,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn interactive(&self, address: IpAddr, command: Option<&str>) -> RemoteResult<i32> {
        debug!(%address, ?command, "ssh interactive");
        let status = Command::new(&self.ssh_program)
            .args(self.ssh_args(address, true, command))
            .kill_on_drop(true)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| self.spawn_error(&self.ssh_program, source))?;
        exit_code(&self.ssh_program, status)
    }

    async fn copy_to(
        &self,
        address: IpAddr,
        local: &Path,
        remote: &str,
        as_root: bool,
    ) -> RemoteResult<()> {
        let from = local.display().to_string();
        self.rsync(from, self.remote_spec(address, remote), as_root)
            .await
    }

    async fn copy_from(
        &self,
        address: IpAddr,
        remote: &str,
        local: &Path,
        as_root: bool,
    ) -> RemoteResult<()> {
        let to = local.display().to_string();
        self.rsync(self.remote_spec(address, remote), to, as_root)
            .await
    }
}
