//! ClusterBootstrap: joining workers to the master.
//!
//! The master mints one join command; every worker then runs it as root
//! with the container runtime socket appended. Workers are only contacted
//! after the join command has been captured.

use tracing::{debug, info};

use forge_core::config::BootstrapConfig;
use forge_machine::Machine;

use crate::error::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone)]
pub struct ClusterBootstrap {
    token_command: String,
    transport_socket: String,
}

impl ClusterBootstrap {
    pub fn new(token_command: impl Into<String>, transport_socket: impl Into<String>) -> Self {
        Self {
            token_command: token_command.into(),
            transport_socket: transport_socket.into(),
        }
    }

    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self::new(config.token_command.clone(), config.transport_socket.clone())
    }

    /// Ask the master for a join command.
    pub async fn join_command(&self, master: &Machine) -> ProvisionResult<String> {
        let output = master.run_capture(&self.token_command).await?;
        if !output.success() {
            return Err(ProvisionError::TokenFailed {
                node: master.to_string(),
                reason: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            });
        }
        let command = output.text();
        if command.is_empty() {
            return Err(ProvisionError::TokenFailed {
                node: master.to_string(),
                reason: "empty output".to_string(),
            });
        }
        debug!(master = %master, join = %command, "join command minted");
        Ok(command.to_string())
    }

    /// The command a worker runs.
    pub fn worker_command(&self, join_command: &str) -> String {
        format!("{join_command} --cri-socket={}", self.transport_socket)
    }

    /// Join every worker to the master.
    pub async fn run(&self, master: &Machine, workers: &[Machine]) -> ProvisionResult<()> {
        if workers.is_empty() {
            info!(master = %master, "single-node cluster, nothing to join");
            return Ok(());
        }
        master.wait_until_ready().await?;
        let join = self.join_command(master).await?;
        let command = self.worker_command(&join);

        for worker in workers {
            info!(node = %worker, "node is joining the cluster");
            let code = worker.run_as_root(&command).await?;
            if code != 0 {
                return Err(ProvisionError::JoinFailed {
                    node: worker.to_string(),
                    code,
                });
            }
        }
        info!(master = %master, workers = workers.len(), "cluster bootstrapped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use forge_core::VmIdentity;
    use forge_hypervisor::testkit::InMemoryHypervisor;
    use forge_machine::{MachineContext, ReadinessProtocol};
    use forge_remote::testkit::ScriptedExec;

    const JOIN: &str = "kubeadm join 192.168.1.110:6443 --token abc.def";

    fn cluster() -> (Arc<InMemoryHypervisor>, Arc<ScriptedExec>, Machine, Vec<Machine>) {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("tapir", 8));
        let remote = Arc::new(ScriptedExec::new());
        let ctx = Arc::new(MachineContext::new(
            hv.clone(),
            remote.clone(),
            vec!["192.168.1.0/24".parse().unwrap()],
            ReadinessProtocol::new(Duration::from_millis(10), Duration::from_secs(5)),
        ));
        let mut machines = Vec::new();
        for (id, name) in [(500, "kb1"), (501, "kb2"), (502, "kb3")] {
            hv.add_vm("tapir", id, name, "running", 2);
            let identity = VmIdentity {
                id,
                name: name.to_string(),
                host: "tapir".to_string(),
            };
            machines.push(Machine::vm(identity, ctx.clone()));
        }
        let master = machines.remove(0);
        (hv, remote, master, machines)
    }

    fn bootstrap() -> ClusterBootstrap {
        ClusterBootstrap::from_config(&BootstrapConfig::default())
    }

    #[tokio::test]
    async fn workers_run_the_minted_command() {
        let (hv, remote, master, workers) = cluster();
        remote.respond("token create", 0, &format!("{JOIN}\n"));

        bootstrap().run(&master, &workers).await.unwrap();

        assert_eq!(remote.commands_matching("token create").len(), 1);
        let expected = format!("{JOIN} --cri-socket=unix:///var/run/cri-dockerd.sock");
        for id in [501, 502] {
            let commands = hv.agent_commands(id);
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0][2], expected);
        }
        assert!(hv.agent_commands(500).is_empty());
    }

    #[tokio::test]
    async fn failed_token_contacts_no_worker() {
        let (hv, remote, master, workers) = cluster();
        remote.respond("token create", 1, "");

        let err = bootstrap().run(&master, &workers).await.unwrap_err();
        assert!(matches!(err, ProvisionError::TokenFailed { .. }));
        assert!(hv.agent_commands(501).is_empty());
        assert!(hv.agent_commands(502).is_empty());
    }

    #[tokio::test]
    async fn failed_join_is_reported() {
        let (hv, remote, master, workers) = cluster();
        remote.respond("token create", 0, JOIN);
        hv.set_exec_exit("kubeadm join", 1);

        let err = bootstrap().run(&master, &workers).await.unwrap_err();
        assert!(matches!(err, ProvisionError::JoinFailed { code: 1, .. }));
    }

    #[tokio::test]
    async fn single_node_needs_no_token() {
        let (_hv, remote, master, _workers) = cluster();
        bootstrap().run(&master, &[]).await.unwrap();
        assert!(remote.calls().is_empty());
    }
}
