//! Provisioner: one node from template to initialized machine, and the
//! fan-out of that sequence across a cluster.
//!
//! Each node runs the steps in order and stops at the first unrecoverable
//! error. Teardown, when requested, runs afterwards whatever the outcome,
//! but only for a VM this run actually cloned.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use forge_core::{CancelSignal, ForgeConfig, NodeStatus, VmId, VmIdentity};
use forge_hypervisor::{GatewayError, HypervisorGateway, TaskRef, TaskWaiter};
use forge_inventory::{IdAllocator, Inventory, VmEntry};
use forge_machine::{Machine, MachineContext, MachineResolver, ReadinessProtocol};
use forge_placement::Placer;
use forge_remote::RemoteExec;

use crate::bootstrap::ClusterBootstrap;
use crate::error::{ProvisionError, ProvisionResult};
use crate::settings::{INIT_SCRIPT_PATH, POST_INIT_PATH, ProvisionSettings, init_command, post_init_command};

// ── Requests and reports ──────────────────────────────────────────

/// What to provision for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeRequest {
    pub name: String,
    /// Explicit id; allocated when absent.
    pub id: Option<VmId>,
    pub post_init_script: Option<PathBuf>,
    /// Attach a shell once the node is initialized.
    pub interactive: bool,
    /// Destroy the node when the sequence ends, whatever the outcome.
    pub teardown: bool,
}

impl NodeRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: VmId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_post_init_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.post_init_script = Some(script.into());
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_teardown(mut self, teardown: bool) -> Self {
        self.teardown = teardown;
        self
    }
}

/// A node that went through the whole sequence.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub machine: Machine,
    /// Address the node was last verified ready on.
    pub address: IpAddr,
}

impl NodeReport {
    pub fn identity(&self) -> Option<&VmIdentity> {
        self.machine.identity()
    }
}

/// Result of a cluster fan-out; nodes in request order, master first.
#[derive(Debug, Clone)]
pub struct ClusterReport {
    pub nodes: Vec<NodeReport>,
}

impl ClusterReport {
    pub fn master(&self) -> Option<&NodeReport> {
        self.nodes.first()
    }

    pub fn workers(&self) -> &[NodeReport] {
        self.nodes.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// The VM was already gone.
    Missing,
}

#[derive(Debug, Default)]
pub struct DestroyReport {
    pub destroyed: Vec<VmIdentity>,
    pub missing: Vec<VmIdentity>,
    pub failed: Vec<(VmIdentity, ProvisionError)>,
}

impl DestroyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

// ── Provisioner ───────────────────────────────────────────────────

pub struct Provisioner {
    gateway: Arc<dyn HypervisorGateway>,
    inventory: Arc<Inventory>,
    allocator: IdAllocator,
    placer: Placer,
    waiter: TaskWaiter,
    /// Never cancelled, so teardown still completes after an interrupt.
    teardown_waiter: TaskWaiter,
    resolver: MachineResolver,
    settings: ProvisionSettings,
    bootstrap: ClusterBootstrap,
    cancel: CancelSignal,
    /// Serializes clone + host-idle wait per host.
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(
        gateway: Arc<dyn HypervisorGateway>,
        remote: Arc<dyn RemoteExec>,
        config: &ForgeConfig,
        cancel: CancelSignal,
    ) -> ProvisionResult<Self> {
        let inventory = Arc::new(Inventory::new(gateway.clone(), config.protected_ranges()));
        let allocator = IdAllocator::new(inventory.clone(), config.ids.scan_start);
        let placer = Placer::new(gateway.clone(), config.hypervisor.templates.clone());

        let teardown_waiter = TaskWaiter::new(gateway.clone(), &config.hypervisor.user)
            .with_poll_interval(config.hypervisor.task_poll_interval()?)
            .with_timeout(config.hypervisor.task_timeout()?);
        let waiter = teardown_waiter.clone().with_cancel(cancel.clone());

        let readiness = ReadinessProtocol::new(
            config.readiness.poll_interval()?,
            config.readiness.stage_timeout()?,
        )
        .with_cancel(cancel.clone());
        let ctx = Arc::new(MachineContext::new(
            gateway.clone(),
            remote,
            config.home_networks()?,
            readiness,
        ));
        let resolver = MachineResolver::new(inventory.clone(), ctx);

        Ok(Self {
            gateway,
            inventory,
            allocator,
            placer,
            waiter,
            teardown_waiter,
            resolver,
            settings: ProvisionSettings::from_config(&config.provision)?,
            bootstrap: ClusterBootstrap::from_config(&config.bootstrap),
            cancel,
            host_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn resolver(&self) -> &MachineResolver {
        &self.resolver
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    pub fn bootstrap(&self) -> &ClusterBootstrap {
        &self.bootstrap
    }

    /// Every unprotected VM with its current status.
    pub async fn list(&self) -> ProvisionResult<Vec<VmEntry>> {
        Ok(self.inventory.refresh().await?.vms().cloned().collect())
    }

    // ── Single node ───────────────────────────────────────────────

    /// Run the full sequence for one node.
    pub async fn provision_node(&self, request: NodeRequest) -> ProvisionResult<NodeReport> {
        let id = match request.id {
            Some(id) => self.allocator.claim(id).await?,
            None => self.allocator.allocate(1).await?[0],
        };
        let result = self.provision_with_id(&request, id).await;
        self.allocator.release(&[id]).await;
        result
    }

    /// Run the full sequence for one node whose id is already reserved.
    async fn provision_with_id(&self, request: &NodeRequest, id: VmId) -> ProvisionResult<NodeReport> {
        let mut cloned: Option<VmIdentity> = None;
        let result = self.clone_and_install(request, id, &mut cloned).await;

        match &result {
            Ok(report) => info!(node = %report.machine, address = %report.address, "node provisioned"),
            Err(e) if e.is_cancelled() => warn!(node = %request.name, vmid = id, "provisioning cancelled"),
            Err(e) => error!(node = %request.name, vmid = id, error = %e, "provisioning failed"),
        }

        if request.teardown {
            match cloned {
                Some(identity) => {
                    info!(node = %identity, "tearing down node");
                    // A cancelled clone may still hold the VM lock on the host.
                    if let Err(e) = self.teardown_waiter.wait_for_host_idle(&identity.host).await {
                        warn!(node = %identity, error = %e, "host still busy before teardown");
                    }
                    if let Err(e) = self.destroy(&identity).await {
                        error!(node = %identity, error = %e, "teardown failed");
                        if result.is_ok() {
                            return Err(e);
                        }
                    }
                }
                None => debug!(node = %request.name, vmid = id, "nothing was cloned, skipping teardown"),
            }
        }
        result
    }

    async fn clone_and_install(
        &self,
        request: &NodeRequest,
        id: VmId,
        cloned: &mut Option<VmIdentity>,
    ) -> ProvisionResult<NodeReport> {
        let placement = self.placer.choose().await?;
        info!(node = %request.name, vmid = id, host = %placement.host, template = placement.template, "cloning node");

        {
            let host_lock = self.host_lock(&placement.host).await;
            let _guard = host_lock.lock().await;
            let task = self
                .gateway
                .clone_vm(&placement.host, placement.template, id, &request.name)
                .await?;
            *cloned = Some(VmIdentity {
                id,
                name: request.name.clone(),
                host: placement.host.clone(),
            });
            if !matches!(task, TaskRef::Completed(_)) {
                self.waiter.wait(&task).await?;
            }
            self.waiter.wait_for_host_idle(&placement.host).await?;
        }
        self.inventory.invalidate().await;

        let machine = self.resolver.resolve_id(id).await?;
        self.start(&machine).await?;

        let address = self
            .install(&machine, request.post_init_script.as_deref(), request.interactive)
            .await?;
        Ok(NodeReport { machine, address })
    }

    async fn host_lock(&self, host: &str) -> Arc<Mutex<()>> {
        self.host_locks
            .lock()
            .await
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// Power on a VM and wait for the start task.
    pub async fn start(&self, machine: &Machine) -> ProvisionResult<()> {
        let identity = machine
            .identity()
            .ok_or_else(|| ProvisionError::NotAVm(machine.to_string()))?;
        info!(node = %machine, "starting VM");
        let task = self.gateway.start_vm(&identity.host, identity.id).await?;
        self.waiter.wait_success(&task).await?;
        Ok(())
    }

    /// Initialize an existing machine: readiness, init script, reboot,
    /// readiness again, then the post-init steps.
    pub async fn install(
        &self,
        machine: &Machine,
        post_init_script: Option<&Path>,
        interactive: bool,
    ) -> ProvisionResult<IpAddr> {
        machine.wait_until_ready().await?;

        machine.upload(&self.settings.init_script, INIT_SCRIPT_PATH).await?;
        let code = machine.run_blocking(&init_command(machine.name())).await?;
        if !self.settings.accepts_init_exit(code) {
            return Err(ProvisionError::InitScript {
                node: machine.to_string(),
                code,
            });
        }
        debug!(node = %machine, code, "init script finished");

        self.pause(machine, self.settings.reboot_grace).await?;
        let address = machine.wait_until_ready().await?;

        tokio::select! {
            result = self.post_init(machine, post_init_script, interactive) => result?,
            _ = self.cancel.cancelled() => return Err(ProvisionError::Cancelled(machine.to_string())),
        }
        Ok(address)
    }

    /// Payload steps, post-init script, interactive session.
    async fn post_init(
        &self,
        machine: &Machine,
        post_init_script: Option<&Path>,
        interactive: bool,
    ) -> ProvisionResult<()> {
        for step in &self.settings.payload {
            info!(node = %machine, source = %step.source.display(), dest = %step.dest, "syncing payload");
            machine.sync_to(&step.source, &step.dest, step.as_root).await?;
            if let Some(command) = &step.command {
                self.run_checked(machine, command).await?;
            }
        }

        if let Some(script) = post_init_script {
            info!(node = %machine, script = %script.display(), "running post-init script");
            machine.upload(script, POST_INIT_PATH).await?;
            self.run_checked(machine, &post_init_command()).await?;
        }

        if interactive {
            machine.interactive(None).await?;
        }
        Ok(())
    }

    async fn run_checked(&self, machine: &Machine, command: &str) -> ProvisionResult<()> {
        let code = machine.run_blocking(command).await?;
        if code != 0 {
            return Err(ProvisionError::RemoteCommand {
                node: machine.to_string(),
                command: command.to_string(),
                code,
            });
        }
        Ok(())
    }

    async fn pause(&self, machine: &Machine, duration: Duration) -> ProvisionResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(ProvisionError::Cancelled(machine.to_string())),
        }
    }

    // ── Teardown ──────────────────────────────────────────────────

    /// Stop (if running) and delete a VM.
    ///
    /// Checks the hypervisor directly rather than the cached inventory, so
    /// a VM that is already gone is reported as [`DestroyOutcome::Missing`].
    pub async fn destroy(&self, identity: &VmIdentity) -> ProvisionResult<DestroyOutcome> {
        if self.inventory.protected().is_protected(identity.id) {
            return Err(ProvisionError::Protected(identity.id));
        }
        let current = self
            .gateway
            .list_vms(&identity.host)
            .await?
            .into_iter()
            .find(|vm| vm.id == identity.id);
        let Some(vm) = current else {
            info!(node = %identity, "VM does not exist, nothing to destroy");
            return Ok(DestroyOutcome::Missing);
        };

        if NodeStatus::from_state(&vm.status) == NodeStatus::Running {
            info!(node = %identity, "stopping VM");
            let task = self.gateway.stop_vm(&identity.host, identity.id).await?;
            self.teardown_waiter.wait_success(&task).await?;
        }

        info!(node = %identity, "deleting VM");
        let task = match self.gateway.delete_vm(&identity.host, identity.id).await {
            Ok(task) => task,
            Err(GatewayError::NotFound(_)) => {
                info!(node = %identity, "VM vanished before delete");
                self.inventory.invalidate().await;
                return Ok(DestroyOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };
        self.teardown_waiter.wait_success(&task).await?;
        self.inventory.invalidate().await;
        info!(node = %identity, "VM destroyed");
        Ok(DestroyOutcome::Destroyed)
    }

    pub async fn destroy_by_name(&self, name: &str) -> ProvisionResult<DestroyOutcome> {
        match self.inventory.vm_by_name(name).await? {
            Some(entry) => self.destroy(&entry.identity).await,
            None => {
                info!(node = %name, "no VM with that name, nothing to destroy");
                Ok(DestroyOutcome::Missing)
            }
        }
    }

    pub async fn destroy_by_id(&self, id: VmId) -> ProvisionResult<DestroyOutcome> {
        if self.inventory.protected().is_protected(id) {
            return Err(ProvisionError::Protected(id));
        }
        match self.inventory.vm_by_id(id).await? {
            Some(entry) => self.destroy(&entry.identity).await,
            None => {
                info!(vmid = id, "no VM with that id, nothing to destroy");
                Ok(DestroyOutcome::Missing)
            }
        }
    }

    /// Destroy every unprotected VM; one failure does not stop the rest.
    pub async fn destroy_all(&self) -> ProvisionResult<DestroyReport> {
        let mut report = DestroyReport::default();
        let identities: Vec<VmIdentity> = self
            .inventory
            .refresh()
            .await?
            .vms()
            .map(|entry| entry.identity.clone())
            .collect();
        for identity in identities {
            match self.destroy(&identity).await {
                Ok(DestroyOutcome::Destroyed) => report.destroyed.push(identity),
                Ok(DestroyOutcome::Missing) => report.missing.push(identity),
                Err(e) => {
                    error!(node = %identity, error = %e, "destroy failed");
                    report.failed.push((identity, e));
                }
            }
        }
        Ok(report)
    }

    // ── Cluster ───────────────────────────────────────────────────

    /// Provision every node concurrently.
    ///
    /// All missing ids are allocated in a single call before any node is
    /// launched. Launches are spaced by the configured stagger. The first
    /// request is the master and gets the master post-init script unless
    /// it names its own.
    pub async fn provision_nodes(
        self: &Arc<Self>,
        mut requests: Vec<NodeRequest>,
    ) -> ProvisionResult<ClusterReport> {
        if requests.is_empty() {
            return Err(ProvisionError::NoNodes);
        }
        if let Some(master) = requests.first_mut() {
            if master.post_init_script.is_none() {
                master.post_init_script = self.settings.master_post_init_script.clone();
            }
        }

        let ids = self.reserve_ids(&requests).await?;
        let mut handles: Vec<(String, Option<JoinHandle<ProvisionResult<NodeReport>>>)> = Vec::new();
        for (index, (request, id)) in requests.into_iter().zip(ids.iter().copied()).enumerate() {
            if index > 0 && !self.settings.launch_stagger.is_zero() {
                let stopped = tokio::select! {
                    _ = tokio::time::sleep(self.settings.launch_stagger) => false,
                    _ = self.cancel.cancelled() => true,
                };
                if stopped {
                    warn!(node = %request.name, "cancelled before launch");
                    handles.push((request.name, None));
                    continue;
                }
            }
            info!(node = %request.name, vmid = id, "launching node");
            let name = request.name.clone();
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { this.provision_with_id(&request, id).await });
            handles.push((name, Some(handle)));
        }

        let mut nodes = Vec::new();
        let mut failed = Vec::new();
        let mut all_cancelled = true;
        for (name, handle) in handles {
            let result = match handle {
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(ProvisionError::TaskPanicked {
                        node: name.clone(),
                        reason: e.to_string(),
                    }),
                },
                None => Err(ProvisionError::Cancelled(name.clone())),
            };
            match result {
                Ok(report) => nodes.push(report),
                Err(e) => {
                    all_cancelled &= e.is_cancelled();
                    failed.push(name);
                }
            }
        }
        self.allocator.release(&ids).await;

        if failed.is_empty() {
            return Ok(ClusterReport { nodes });
        }
        if all_cancelled {
            return Err(ProvisionError::Cancelled(failed.join(", ")));
        }
        Err(ProvisionError::NodesFailed(failed))
    }

    /// Reserve ids for a batch: a claim for each explicit id, then one
    /// allocation covering every request without one.
    async fn reserve_ids(&self, requests: &[NodeRequest]) -> ProvisionResult<Vec<VmId>> {
        let mut claimed = Vec::new();
        for id in requests.iter().filter_map(|r| r.id) {
            match self.allocator.claim(id).await {
                Ok(id) => claimed.push(id),
                Err(e) => {
                    self.allocator.release(&claimed).await;
                    return Err(e.into());
                }
            }
        }

        let missing = requests.len() - claimed.len();
        let allocated = if missing > 0 {
            match self.allocator.allocate(missing).await {
                Ok(ids) => ids,
                Err(e) => {
                    self.allocator.release(&claimed).await;
                    return Err(e.into());
                }
            }
        } else {
            Vec::new()
        };

        let mut allocated = allocated.into_iter();
        Ok(requests
            .iter()
            .filter_map(|r| r.id.or_else(|| allocated.next()))
            .collect())
    }

    /// Provision every node, then join the workers to the master.
    pub async fn provision_cluster(
        self: &Arc<Self>,
        requests: Vec<NodeRequest>,
    ) -> ProvisionResult<ClusterReport> {
        let report = self.provision_nodes(requests).await?;
        self.configure(&report.nodes.iter().map(|n| n.machine.clone()).collect::<Vec<_>>())
            .await?;
        Ok(report)
    }

    /// Join already provisioned machines; the first one is the master.
    pub async fn configure(&self, machines: &[Machine]) -> ProvisionResult<()> {
        let (master, workers) = machines.split_first().ok_or(ProvisionError::NoNodes)?;
        self.bootstrap.run(master, workers).await
    }
}
