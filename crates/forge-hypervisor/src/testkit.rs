//! In-memory hypervisor for tests.
//!
//! Behaves like a small Proxmox cluster: hosts with CPU counts, template
//! VMs, clones that start stopped, tasks that finish after a configurable
//! number of polls, and a guest agent that comes online some polls after
//! the VM starts. Every mutating call is recorded for assertions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use forge_core::VmId;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{
    AgentExecStatus, GuestInterface, HostRecord, HypervisorGateway, TaskRef, TaskStatus, VmRecord,
};

/// A mutating call observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Clone {
        host: String,
        template: VmId,
        id: VmId,
        name: String,
    },
    Start(VmId),
    Stop(VmId),
    Delete(VmId),
    AgentExec { id: VmId, command: Vec<String> },
    FileWrite { id: VmId, path: String },
}

#[derive(Debug, Clone)]
struct FakeHost {
    name: String,
    online: bool,
    cpus: u32,
}

#[derive(Debug, Clone)]
struct FakeVm {
    host: String,
    name: String,
    status: String,
    cpus: u32,
    addresses: Vec<String>,
    agent_delay: u32,
    /// Task holding the VM config lock, such as the clone that created it.
    lock: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeTask {
    host: String,
    remaining_polls: u32,
    exit_status: String,
}

#[derive(Debug, Default)]
struct State {
    hosts: Vec<FakeHost>,
    vms: BTreeMap<VmId, FakeVm>,
    tasks: HashMap<String, FakeTask>,
    task_seq: u32,
    task_polls: u32,
    task_exit: Option<String>,
    active_polls: HashMap<String, u32>,
    default_agent_delay: u32,
    exec_exit: Vec<(String, i32)>,
    exec_results: HashMap<u64, i32>,
    exec_seq: u64,
    failing_clones: Vec<String>,
    error_payload_clones: bool,
    calls: Vec<GatewayCall>,
    files: Vec<(VmId, String, Vec<u8>)>,
    task_status_calls: usize,
    active_task_calls: usize,
    list_vm_calls: usize,
}

/// In-memory [`HypervisorGateway`].
#[derive(Debug, Default)]
pub struct InMemoryHypervisor {
    state: Mutex<State>,
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, name: &str, cpus: u32) -> Self {
        self.lock().hosts.push(FakeHost {
            name: name.to_string(),
            online: true,
            cpus,
        });
        self
    }

    pub fn with_offline_host(self, name: &str) -> Self {
        self.lock().hosts.push(FakeHost {
            name: name.to_string(),
            online: false,
            cpus: 0,
        });
        self
    }

    /// Register a template VM (stopped, 2 vCPUs) on a host.
    pub fn add_template(&self, host: &str, id: VmId) {
        self.add_vm(host, id, &format!("template-{id}"), "stopped", 2);
    }

    pub fn add_vm(&self, host: &str, id: VmId, name: &str, status: &str, cpus: u32) {
        let addresses = default_addresses(id);
        self.lock().vms.insert(
            id,
            FakeVm {
                host: host.to_string(),
                name: name.to_string(),
                status: status.to_string(),
                cpus,
                addresses,
                agent_delay: 0,
                lock: None,
            },
        );
    }

    pub fn set_addresses(&self, id: VmId, addresses: &[&str]) {
        if let Some(vm) = self.lock().vms.get_mut(&id) {
            vm.addresses = addresses.iter().map(|a| a.to_string()).collect();
        }
    }

    /// Agent-info calls that fail after a clone starts before the agent answers.
    pub fn set_default_agent_delay(&self, polls: u32) {
        self.lock().default_agent_delay = polls;
    }

    /// Polls each new task reports "running" before it stops.
    pub fn set_task_polls(&self, polls: u32) {
        self.lock().task_polls = polls;
    }

    /// Make every new task stop with this exit status instead of "OK".
    pub fn fail_tasks_with(&self, exit_status: &str) {
        self.lock().task_exit = Some(exit_status.to_string());
    }

    /// Polls of the active-task list that report a busy host.
    pub fn set_active_task_polls(&self, host: &str, polls: u32) {
        self.lock().active_polls.insert(host.to_string(), polls);
    }

    /// Exit code for any guest-agent command containing `pattern`.
    pub fn set_exec_exit(&self, pattern: &str, code: i32) {
        self.lock().exec_exit.push((pattern.to_string(), code));
    }

    /// Reject clones of a VM with this name.
    pub fn fail_clone(&self, name: &str) {
        self.lock().failing_clones.push(name.to_string());
    }

    /// Return clone handles wrapped in an error payload.
    pub fn clone_returns_error_payload(&self) {
        self.lock().error_payload_clones = true;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    pub fn clone_calls(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::Clone { .. }))
            .collect()
    }

    pub fn vm_status(&self, id: VmId) -> Option<String> {
        self.lock().vms.get(&id).map(|vm| vm.status.clone())
    }

    pub fn vm_ids(&self) -> Vec<VmId> {
        self.lock().vms.keys().copied().collect()
    }

    pub fn files_written(&self, id: VmId) -> Vec<(String, Vec<u8>)> {
        self.lock()
            .files
            .iter()
            .filter(|(vm, _, _)| *vm == id)
            .map(|(_, path, content)| (path.clone(), content.clone()))
            .collect()
    }

    pub fn agent_commands(&self, id: VmId) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::AgentExec { id: vm, command } if vm == id => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn task_status_calls(&self) -> usize {
        self.lock().task_status_calls
    }

    pub fn active_task_calls(&self) -> usize {
        self.lock().active_task_calls
    }

    pub fn list_vm_calls(&self) -> usize {
        self.lock().list_vm_calls
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    fn new_task(&mut self, host: &str, kind: &str, id: VmId) -> String {
        self.task_seq += 1;
        let seq = self.task_seq;
        let upid = format!("UPID:{host}:{seq:08X}:{seq:08X}:{seq:08X}:{kind}:{id}:root@pam:");
        self.tasks.insert(
            upid.clone(),
            FakeTask {
                host: host.to_string(),
                remaining_polls: self.task_polls,
                exit_status: self.task_exit.clone().unwrap_or_else(|| "OK".to_string()),
            },
        );
        upid
    }

    fn task_running(&self, upid: &str) -> bool {
        self.tasks.get(upid).is_some_and(|t| t.remaining_polls > 0)
    }

    fn vm_on(&mut self, host: &str, id: VmId) -> GatewayResult<&mut FakeVm> {
        match self.vms.get_mut(&id) {
            Some(vm) if vm.host == host => Ok(vm),
            _ => Err(GatewayError::NotFound(format!("VM {id} on {host}"))),
        }
    }

    fn agent_ready(&mut self, host: &str, id: VmId) -> GatewayResult<&mut FakeVm> {
        let vm = self.vm_on(host, id)?;
        if vm.status != "running" {
            return Err(GatewayError::AgentUnavailable(format!("VM {id} is not running")));
        }
        if vm.agent_delay > 0 {
            vm.agent_delay -= 1;
            return Err(GatewayError::AgentUnavailable(format!("VM {id} agent not running")));
        }
        Ok(vm)
    }
}

fn default_addresses(id: VmId) -> Vec<String> {
    vec![
        "127.0.0.1".to_string(),
        format!("10.0.{}.{}", id / 256, id % 256),
        format!("192.168.1.{}", 10 + id % 200),
        "fe80::1".to_string(),
    ]
}

#[async_trait]
impl HypervisorGateway for InMemoryHypervisor {
    async fn list_hosts(&self) -> GatewayResult<Vec<HostRecord>> {
        Ok(self
            .lock()
            .hosts
            .iter()
            .map(|h| HostRecord {
                name: h.name.clone(),
                online: h.online,
            })
            .collect())
    }

    async fn host_cpus(&self, host: &str) -> GatewayResult<u32> {
        self.lock()
            .hosts
            .iter()
            .find(|h| h.name == host)
            .map(|h| h.cpus)
            .ok_or_else(|| GatewayError::NotFound(format!("host {host}")))
    }

    async fn list_vms(&self, host: &str) -> GatewayResult<Vec<VmRecord>> {
        let mut state = self.lock();
        state.list_vm_calls += 1;
        Ok(state
            .vms
            .iter()
            .filter(|(_, vm)| vm.host == host)
            .map(|(id, vm)| VmRecord {
                id: *id,
                name: vm.name.clone(),
                status: vm.status.clone(),
                cpus: vm.cpus,
            })
            .collect())
    }

    async fn cluster_vm_ids(&self) -> GatewayResult<Vec<VmId>> {
        Ok(self.lock().vms.keys().copied().collect())
    }

    async fn clone_vm(
        &self,
        host: &str,
        template: VmId,
        new_id: VmId,
        name: &str,
    ) -> GatewayResult<TaskRef> {
        let mut state = self.lock();
        state.calls.push(GatewayCall::Clone {
            host: host.to_string(),
            template,
            id: new_id,
            name: name.to_string(),
        });
        if state.failing_clones.iter().any(|n| n == name) {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("clone of {name} rejected"),
            });
        }
        if state.vms.contains_key(&new_id) {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("VM {new_id} already exists"),
            });
        }
        let cpus = state.vm_on(host, template)?.cpus;
        let agent_delay = state.default_agent_delay;
        state.vms.insert(
            new_id,
            FakeVm {
                host: host.to_string(),
                name: name.to_string(),
                status: "stopped".to_string(),
                cpus,
                addresses: default_addresses(new_id),
                agent_delay,
                lock: None,
            },
        );
        let upid = state.new_task(host, "qmclone", template);
        state.vm_on(host, new_id)?.lock = Some(upid.clone());
        if state.error_payload_clones {
            return Ok(TaskRef::Error {
                text: format!("{{\"errors\": \"trying to acquire lock... {upid}\"}}"),
            });
        }
        Ok(TaskRef::Handle(upid))
    }

    async fn start_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef> {
        let mut state = self.lock();
        state.calls.push(GatewayCall::Start(id));
        state.vm_on(host, id)?.status = "running".to_string();
        Ok(TaskRef::Handle(state.new_task(host, "qmstart", id)))
    }

    async fn stop_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef> {
        let mut state = self.lock();
        state.calls.push(GatewayCall::Stop(id));
        state.vm_on(host, id)?.status = "stopped".to_string();
        Ok(TaskRef::Handle(state.new_task(host, "qmstop", id)))
    }

    async fn delete_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef> {
        let mut state = self.lock();
        state.calls.push(GatewayCall::Delete(id));
        let vm = state.vm_on(host, id)?;
        if vm.status == "running" {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("VM {id} is running - destroy failed"),
            });
        }
        let lock = vm.lock.clone();
        if lock.is_some_and(|upid| state.task_running(&upid)) {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("VM {id} is locked (clone)"),
            });
        }
        state.vms.remove(&id);
        Ok(TaskRef::Handle(state.new_task(host, "qmdestroy", id)))
    }

    async fn active_tasks(&self, host: &str) -> GatewayResult<Vec<String>> {
        let mut state = self.lock();
        state.active_task_calls += 1;
        let mut active = Vec::new();
        if let Some(remaining) = state.active_polls.get_mut(host).filter(|r| **r > 0) {
            *remaining -= 1;
            active.push(format!("UPID:{host}:00000000:00000000:00000000:qmclone:0:root@pam:"));
        }
        // Each poll of the host advances its running tasks by one step.
        for (upid, task) in state.tasks.iter_mut() {
            if task.host == host && task.remaining_polls > 0 {
                task.remaining_polls -= 1;
                active.push(upid.clone());
            }
        }
        Ok(active)
    }

    async fn task_status(&self, host: &str, upid: &str) -> GatewayResult<TaskStatus> {
        let mut state = self.lock();
        state.task_status_calls += 1;
        if !state.hosts.iter().any(|h| h.name == host) {
            return Err(GatewayError::NotFound(format!("host {host}")));
        }
        let task = state
            .tasks
            .get_mut(upid)
            .ok_or_else(|| GatewayError::NotFound(format!("task {upid}")))?;
        if task.remaining_polls > 0 {
            task.remaining_polls -= 1;
            return Ok(TaskStatus {
                status: "running".to_string(),
                exit_status: None,
            });
        }
        Ok(TaskStatus {
            status: "stopped".to_string(),
            exit_status: Some(task.exit_status.clone()),
        })
    }

    async fn agent_info(&self, host: &str, id: VmId) -> GatewayResult<()> {
        self.lock().agent_ready(host, id).map(|_| ())
    }

    async fn agent_exec(
        &self,
        host: &str,
        id: VmId,
        command: &[String],
        _input: Option<&str>,
    ) -> GatewayResult<u64> {
        let mut state = self.lock();
        state.agent_ready(host, id)?;
        state.calls.push(GatewayCall::AgentExec {
            id,
            command: command.to_vec(),
        });
        let joined = command.join(" ");
        let code = state
            .exec_exit
            .iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        state.exec_seq += 1;
        let pid = state.exec_seq;
        state.exec_results.insert(pid, code);
        Ok(pid)
    }

    async fn agent_exec_status(
        &self,
        _host: &str,
        _id: VmId,
        pid: u64,
    ) -> GatewayResult<AgentExecStatus> {
        let state = self.lock();
        let code = state
            .exec_results
            .get(&pid)
            .ok_or_else(|| GatewayError::NotFound(format!("pid {pid}")))?;
        Ok(AgentExecStatus {
            exited: true,
            exit_code: Some(*code),
            ..AgentExecStatus::default()
        })
    }

    async fn agent_file_write(
        &self,
        host: &str,
        id: VmId,
        path: &str,
        content: &[u8],
    ) -> GatewayResult<()> {
        let mut state = self.lock();
        state.agent_ready(host, id)?;
        state.calls.push(GatewayCall::FileWrite {
            id,
            path: path.to_string(),
        });
        state.files.push((id, path.to_string(), content.to_vec()));
        Ok(())
    }

    async fn agent_network_interfaces(
        &self,
        host: &str,
        id: VmId,
    ) -> GatewayResult<Vec<GuestInterface>> {
        let mut state = self.lock();
        let vm = state.agent_ready(host, id)?;
        Ok(vec![GuestInterface {
            name: "eth0".to_string(),
            addresses: vm.addresses.clone(),
        }])
    }
}
