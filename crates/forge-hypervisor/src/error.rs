//! Hypervisor gateway and task error types.

use std::time::Duration;

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub type TaskResult<T> = Result<T, TaskError>;

/// Errors returned by a [`HypervisorGateway`](crate::HypervisorGateway) call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("hypervisor API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("guest agent unavailable: {0}")]
    AgentUnavailable(String),
}

impl GatewayError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::AgentUnavailable(_)
        ) || matches!(self, GatewayError::Api { status, .. } if *status >= 500)
    }
}

/// Errors raised while resolving or waiting for an asynchronous task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task {upid} did not finish within {elapsed:?}")]
    Timeout { upid: String, elapsed: Duration },

    #[error("tasks on host {host} still active after {elapsed:?}")]
    HostBusy { host: String, elapsed: Duration },

    #[error("task {upid} failed: {exit_status}")]
    Failed { upid: String, exit_status: String },

    #[error("task wait cancelled")]
    Cancelled,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
