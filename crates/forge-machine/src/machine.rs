//! Machine: a VM or a plain network host behind one interface.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use forge_core::{HomeNetwork, ReadinessStage, VmId, VmIdentity};
use forge_hypervisor::HypervisorGateway;
use forge_remote::{CommandOutput, RemoteExec};

use crate::address::{parse_addresses, select_home_address};
use crate::error::{MachineError, MachineResult};
use crate::readiness::{Pending, Probe, ReadinessProtocol, StageTracker};

/// Trivial command proving the shell accepts logins.
const SHELL_PROBE: &str = "true";

/// Exits zero once the service manager has finished booting.
const SERVICES_PROBE: &str = "systemctl is-system-running --wait";

/// Collaborators shared by every machine of one run.
pub struct MachineContext {
    pub gateway: Arc<dyn HypervisorGateway>,
    pub remote: Arc<dyn RemoteExec>,
    pub home: Vec<HomeNetwork>,
    pub readiness: ReadinessProtocol,
}

impl MachineContext {
    pub fn new(
        gateway: Arc<dyn HypervisorGateway>,
        remote: Arc<dyn RemoteExec>,
        home: Vec<HomeNetwork>,
        readiness: ReadinessProtocol,
    ) -> Self {
        Self {
            gateway,
            remote,
            home,
            readiness,
        }
    }
}

/// How a machine is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineKind {
    /// A hypervisor VM; the guest agent is available.
    Vm(VmIdentity),
    /// A host resolved through DNS; network only.
    Host { name: String },
}

#[derive(Clone)]
pub struct Machine {
    kind: MachineKind,
    ctx: Arc<MachineContext>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine").field("kind", &self.kind).finish()
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MachineKind::Vm(identity) => write!(f, "{} [{}]", identity.name, identity.id),
            MachineKind::Host { name } => f.write_str(name),
        }
    }
}

impl Machine {
    pub fn vm(identity: VmIdentity, ctx: Arc<MachineContext>) -> Self {
        Self {
            kind: MachineKind::Vm(identity),
            ctx,
        }
    }

    pub fn host(name: impl Into<String>, ctx: Arc<MachineContext>) -> Self {
        Self {
            kind: MachineKind::Host { name: name.into() },
            ctx,
        }
    }

    pub fn kind(&self) -> &MachineKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            MachineKind::Vm(identity) => &identity.name,
            MachineKind::Host { name } => name,
        }
    }

    /// VM identity, if this machine is a VM.
    pub fn identity(&self) -> Option<&VmIdentity> {
        match &self.kind {
            MachineKind::Vm(identity) => Some(identity),
            MachineKind::Host { .. } => None,
        }
    }

    pub fn id(&self) -> Option<VmId> {
        self.identity().map(|identity| identity.id)
    }

    // ── Addressing ────────────────────────────────────────────────

    /// Enumerate candidate addresses without filtering.
    async fn candidate_addresses(&self) -> MachineResult<Vec<IpAddr>> {
        match &self.kind {
            MachineKind::Vm(identity) => {
                let interfaces = self
                    .ctx
                    .gateway
                    .agent_network_interfaces(&identity.host, identity.id)
                    .await?;
                let raw: Vec<String> = interfaces.into_iter().flat_map(|i| i.addresses).collect();
                Ok(parse_addresses(&raw))
            }
            MachineKind::Host { name } => {
                let resolved = tokio::net::lookup_host((name.as_str(), 22))
                    .await
                    .map_err(|_| MachineError::NotFound(name.clone()))?;
                Ok(resolved.map(|sa| sa.ip()).collect())
            }
        }
    }

    /// The address used to reach this machine over the network.
    ///
    /// [`MachineError::NotReady`] when addresses exist but none is in a
    /// home network.
    pub async fn address(&self) -> MachineResult<IpAddr> {
        let candidates = self.candidate_addresses().await?;
        select_home_address(&candidates, &self.ctx.home)
            .ok_or_else(|| MachineError::NotReady(self.to_string()))
    }

    async fn probe_address(&self) -> Probe<IpAddr> {
        match self.candidate_addresses().await {
            Ok(candidates) => match select_home_address(&candidates, &self.ctx.home) {
                Some(ip) => Probe::Ready(ip),
                None => Probe::Pending(Pending::NoHomeAddress {
                    candidates: candidates.len(),
                }),
            },
            Err(e) => Probe::Pending(Pending::Transient(e.to_string())),
        }
    }

    // ── Readiness ─────────────────────────────────────────────────

    /// Block until the machine accepts commands and has finished booting.
    ///
    /// Returns the address the machine was verified on.
    pub async fn wait_until_ready(&self) -> MachineResult<IpAddr> {
        let subject = self.to_string();
        let protocol = &self.ctx.readiness;
        let mut tracker = StageTracker::new();
        info!(machine = %subject, "waiting for machine to become ready");

        if let MachineKind::Vm(identity) = &self.kind {
            protocol
                .poll(&subject, ReadinessStage::AgentOnline, || async {
                    match self.ctx.gateway.agent_info(&identity.host, identity.id).await {
                        Ok(()) => Probe::Ready(()),
                        Err(e) => Probe::Pending(Pending::Transient(e.to_string())),
                    }
                })
                .await?;
            tracker.advance(ReadinessStage::AgentOnline);
        }

        let address = protocol
            .poll(&subject, ReadinessStage::AddressAssigned, || self.probe_address())
            .await?;
        tracker.advance(ReadinessStage::AddressAssigned);
        debug!(machine = %subject, %address, "address assigned");

        protocol
            .poll(&subject, ReadinessStage::ShellReady, || {
                self.probe_command(address, SHELL_PROBE)
            })
            .await?;
        tracker.advance(ReadinessStage::ShellReady);

        protocol
            .poll(&subject, ReadinessStage::ServicesReady, || {
                self.probe_command(address, SERVICES_PROBE)
            })
            .await?;
        tracker.advance(ReadinessStage::ServicesReady);

        info!(machine = %subject, %address, stage = %tracker.reached(), "machine ready");
        Ok(address)
    }

    async fn probe_command(&self, address: IpAddr, command: &str) -> Probe<()> {
        match self.ctx.remote.run(address, command).await {
            Ok(0) => Probe::Ready(()),
            Ok(code) => Probe::Pending(Pending::Transient(format!("{command:?} exited with {code}"))),
            Err(e) => Probe::Pending(Pending::Transient(e.to_string())),
        }
    }

    // ── Commands ──────────────────────────────────────────────────

    /// Run a command as the login user; returns its exit code.
    pub async fn run_blocking(&self, command: &str) -> MachineResult<i32> {
        let address = self.address().await?;
        debug!(machine = %self, %command, "running command");
        let code = self.ctx.remote.run(address, command).await?;
        debug!(machine = %self, %command, code, "command exited");
        Ok(code)
    }

    pub async fn run_capture(&self, command: &str) -> MachineResult<CommandOutput> {
        let address = self.address().await?;
        debug!(machine = %self, %command, "running command with captured output");
        Ok(self.ctx.remote.run_capture(address, command).await?)
    }

    /// Run a command as root.
    ///
    /// VMs use the guest agent, which works without network access.
    /// Hosts go through `sudo` over the network.
    pub async fn run_as_root(&self, command: &str) -> MachineResult<i32> {
        match &self.kind {
            MachineKind::Vm(identity) => self.agent_exec(identity, command).await,
            MachineKind::Host { .. } => {
                let wrapped = format!("sudo sh -c {}", shell_quote(command));
                self.run_blocking(&wrapped).await
            }
        }
    }

    async fn agent_exec(&self, identity: &VmIdentity, command: &str) -> MachineResult<i32> {
        info!(machine = %self, %command, "running command through the guest agent");
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let gateway = &self.ctx.gateway;
        let protocol = &self.ctx.readiness;
        let pid = gateway
            .agent_exec(&identity.host, identity.id, &argv, None)
            .await?;

        let started = Instant::now();
        loop {
            let status = gateway
                .agent_exec_status(&identity.host, identity.id, pid)
                .await?;
            if status.exited {
                if let Some(err) = status.err_data.as_deref().filter(|s| !s.is_empty()) {
                    debug!(machine = %self, stderr = %err, "guest command stderr");
                }
                if let Some(out) = status.out_data.as_deref().filter(|s| !s.is_empty()) {
                    debug!(machine = %self, stdout = %out, "guest command stdout");
                }
                let code = status.code();
                debug!(machine = %self, pid, code, "guest command exited");
                return Ok(code);
            }
            if started.elapsed() >= protocol.stage_timeout() {
                return Err(MachineError::CommandTimeout {
                    subject: self.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(protocol.poll_interval()) => {}
                _ = protocol.cancel_signal().cancelled() => {
                    return Err(MachineError::Cancelled(self.to_string()));
                }
            }
        }
    }

    /// Attach the terminal to a shell or to `command`.
    pub async fn interactive(&self, command: Option<&str>) -> MachineResult<i32> {
        let address = self.address().await?;
        Ok(self.ctx.remote.interactive(address, command).await?)
    }

    // ── Files ─────────────────────────────────────────────────────

    /// Place a local file at `remote`.
    ///
    /// Regular files go to VMs through the guest agent; directories, and
    /// everything for hosts, are copied over the network.
    pub async fn upload(&self, local: &Path, remote: &str) -> MachineResult<()> {
        if let MachineKind::Vm(identity) = &self.kind {
            if local.is_file() {
                let content = tokio::fs::read(local).await.map_err(|source| MachineError::Io {
                    path: local.to_path_buf(),
                    source,
                })?;
                debug!(machine = %self, path = %local.display(), %remote, bytes = content.len(), "uploading through the guest agent");
                self.ctx
                    .gateway
                    .agent_file_write(&identity.host, identity.id, remote, &content)
                    .await?;
                return Ok(());
            }
        }
        self.sync_to(local, remote, false).await
    }

    /// Recursively copy a local path to the machine.
    pub async fn sync_to(&self, local: &Path, remote: &str, as_root: bool) -> MachineResult<()> {
        let address = self.address().await?;
        debug!(machine = %self, path = %local.display(), %remote, as_root, "syncing to machine");
        Ok(self.ctx.remote.copy_to(address, local, remote, as_root).await?)
    }

    /// Recursively copy a remote path back to this computer.
    pub async fn sync_from(&self, remote: &str, local: &Path, as_root: bool) -> MachineResult<()> {
        let address = self.address().await?;
        debug!(machine = %self, %remote, path = %local.display(), as_root, "syncing from machine");
        Ok(self.ctx.remote.copy_from(address, remote, local, as_root).await?)
    }
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
