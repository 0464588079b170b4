//! Provisioning error types.

use thiserror::Error;

use forge_core::{ConfigError, VmId};
use forge_hypervisor::{GatewayError, TaskError};
use forge_inventory::InventoryError;
use forge_machine::MachineError;
use forge_placement::PlacementError;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("at least one node is required")]
    NoNodes,

    #[error("init script on {node} exited with {code}")]
    InitScript { node: String, code: i32 },

    #[error("{command:?} on {node} exited with {code}")]
    RemoteCommand {
        node: String,
        command: String,
        code: i32,
    },

    #[error("VM id {0} is protected")]
    Protected(VmId),

    #[error("{0} is not a hypervisor VM")]
    NotAVm(String),

    #[error("could not obtain a join command from {node}: {reason}")]
    TokenFailed { node: String, reason: String },

    #[error("{node} failed to join the cluster (exit code {code})")]
    JoinFailed { node: String, code: i32 },

    #[error("provisioning failed for: {}", .0.join(", "))]
    NodesFailed(Vec<String>),

    #[error("provisioning of {0} was cancelled")]
    Cancelled(String),

    #[error("provisioning task for {node} panicked: {reason}")]
    TaskPanicked { node: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Machine(#[from] MachineError),
}

impl ProvisionError {
    /// True for user interruption, as opposed to a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ProvisionError::Cancelled(_) => true,
            ProvisionError::Task(TaskError::Cancelled) => true,
            ProvisionError::Machine(e) => e.is_cancelled(),
            _ => false,
        }
    }
}
