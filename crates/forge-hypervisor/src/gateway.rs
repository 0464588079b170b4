//! The hypervisor gateway contract.
//!
//! Thin interface over the node, VM, task and guest-agent endpoints. The
//! orchestrator never sees wire formats, only these records.

use async_trait::async_trait;

use forge_core::VmId;

use crate::error::GatewayResult;

/// A physical host as listed by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub name: String,
    pub online: bool,
}

/// A VM as listed on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub id: VmId,
    pub name: String,
    /// Raw state string, e.g. "running".
    pub status: String,
    /// Allocated vCPUs.
    pub cpus: u32,
}

/// What a mutating call returned in place of a task handle.
///
/// The hypervisor is not consistent here: usually a handle string, but
/// sometimes a payload for something that already finished, or an error
/// body with a handle buried in free-form text.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRef {
    Handle(String),
    Completed(serde_json::Value),
    Error { text: String },
}

/// Status of an asynchronous hypervisor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    /// "running" or "stopped".
    pub status: String,
    /// Set once stopped; "OK" on success.
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }

    pub fn succeeded(&self) -> bool {
        self.is_stopped() && self.exit_status.as_deref() == Some("OK")
    }
}

/// Result of polling a guest-agent command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentExecStatus {
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub out_data: Option<String>,
    pub err_data: Option<String>,
}

impl AgentExecStatus {
    /// Exit code, or the terminating signal when there is no exit code.
    pub fn code(&self) -> i32 {
        self.exit_code.or(self.signal).unwrap_or(-1)
    }
}

/// A network interface reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    /// Addresses as reported; not yet parsed.
    pub addresses: Vec<String>,
}

#[async_trait]
pub trait HypervisorGateway: Send + Sync {
    async fn list_hosts(&self) -> GatewayResult<Vec<HostRecord>>;

    /// Physical CPU count of a host.
    async fn host_cpus(&self, host: &str) -> GatewayResult<u32>;

    async fn list_vms(&self, host: &str) -> GatewayResult<Vec<VmRecord>>;

    /// Every VM id the cluster knows about, including those on offline hosts.
    async fn cluster_vm_ids(&self) -> GatewayResult<Vec<VmId>>;

    async fn clone_vm(
        &self,
        host: &str,
        template: VmId,
        new_id: VmId,
        name: &str,
    ) -> GatewayResult<TaskRef>;

    async fn start_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef>;

    async fn stop_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef>;

    async fn delete_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef>;

    /// Handles of every task still running on a host.
    async fn active_tasks(&self, host: &str) -> GatewayResult<Vec<String>>;

    async fn task_status(&self, host: &str, upid: &str) -> GatewayResult<TaskStatus>;

    /// Succeeds once the in-guest agent answers.
    async fn agent_info(&self, host: &str, id: VmId) -> GatewayResult<()>;

    /// Start a command through the guest agent; returns its pid.
    async fn agent_exec(
        &self,
        host: &str,
        id: VmId,
        command: &[String],
        input: Option<&str>,
    ) -> GatewayResult<u64>;

    async fn agent_exec_status(&self, host: &str, id: VmId, pid: u64)
    -> GatewayResult<AgentExecStatus>;

    async fn agent_file_write(
        &self,
        host: &str,
        id: VmId,
        path: &str,
        content: &[u8],
    ) -> GatewayResult<()>;

    async fn agent_network_interfaces(&self, host: &str, id: VmId)
    -> GatewayResult<Vec<GuestInterface>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_success() {
        let status = TaskStatus {
            status: "stopped".to_string(),
            exit_status: Some("OK".to_string()),
        };
        assert!(status.is_stopped());
        assert!(status.succeeded());
    }

    #[test]
    fn task_status_running_is_not_success() {
        let status = TaskStatus {
            status: "running".to_string(),
            exit_status: None,
        };
        assert!(!status.is_stopped());
        assert!(!status.succeeded());
    }

    #[test]
    fn agent_code_falls_back_to_signal() {
        let status = AgentExecStatus {
            exited: true,
            signal: Some(9),
            ..AgentExecStatus::default()
        };
        assert_eq!(status.code(), 9);
    }
}
