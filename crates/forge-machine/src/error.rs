//! Error types for machines and the readiness protocol.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use forge_core::ReadinessStage;
use forge_hypervisor::GatewayError;
use forge_inventory::InventoryError;
use forge_remote::RemoteError;

pub type MachineResult<T> = Result<T, MachineError>;

pub type ReadinessResult<T> = Result<T, ReadinessError>;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("{subject} did not reach {stage} within {elapsed:?}")]
    Timeout {
        subject: String,
        stage: ReadinessStage,
        elapsed: Duration,
    },

    #[error("waiting for {subject} to reach {stage} was cancelled")]
    Cancelled {
        subject: String,
        stage: ReadinessStage,
    },
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("no machine named {0:?}")]
    NotFound(String),

    /// Addresses were enumerated but none is in a home network.
    #[error("{0} has no address in a home network yet")]
    NotReady(String),

    #[error("guest command on {subject} did not exit within {elapsed:?}")]
    CommandTimeout { subject: String, elapsed: Duration },

    #[error("operation on {0} cancelled")]
    Cancelled(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl MachineError {
    /// Whether the error stems from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            MachineError::Cancelled(_) | MachineError::Readiness(ReadinessError::Cancelled { .. })
        )
    }
}
