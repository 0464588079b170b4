//! Waiting for asynchronous hypervisor tasks.
//!
//! Every mutating hypervisor call spawns a task on some host. The waiter
//! resolves the returned [`TaskRef`] into a handle and polls the task
//! status endpoint on the handle's host until the task reports "stopped".
//! Polling is bounded by a timeout and aborts on cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use forge_core::CancelSignal;

use crate::error::{TaskError, TaskResult};
use crate::gateway::{HypervisorGateway, TaskRef, TaskStatus};
use crate::task::TaskHandle;

/// Polls hypervisor tasks to completion.
#[derive(Clone)]
pub struct TaskWaiter {
    gateway: Arc<dyn HypervisorGateway>,
    /// Trailing `<user>:` field of every handle issued for our API user.
    user_marker: String,
    poll_interval: Duration,
    timeout: Duration,
    cancel: CancelSignal,
}

impl TaskWaiter {
    /// Create a waiter for handles issued to `api_user` (e.g. `root@pam`).
    pub fn new(gateway: Arc<dyn HypervisorGateway>, api_user: &str) -> Self {
        Self {
            gateway,
            user_marker: format!("{api_user}:"),
            poll_interval: Duration::from_millis(300),
            timeout: Duration::from_secs(600),
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait until the task behind `task` has stopped, whatever its outcome.
    pub async fn wait(&self, task: &TaskRef) -> TaskResult<TaskStatus> {
        let handle = TaskHandle::from_ref(task, &self.user_marker)?;
        self.wait_handle(&handle).await
    }

    /// Wait and additionally require the task to have exited "OK".
    pub async fn wait_success(&self, task: &TaskRef) -> TaskResult<TaskStatus> {
        let handle = TaskHandle::from_ref(task, &self.user_marker)?;
        let status = self.wait_handle(&handle).await?;
        if !status.succeeded() {
            return Err(TaskError::Failed {
                upid: handle.to_string(),
                exit_status: status.exit_status.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(status)
    }

    pub async fn wait_handle(&self, handle: &TaskHandle) -> TaskResult<TaskStatus> {
        let started = Instant::now();
        debug!(upid = %handle, host = handle.node(), "waiting for task");

        loop {
            let status = self
                .gateway
                .task_status(handle.node(), handle.as_str())
                .await?;
            if status.is_stopped() {
                if !status.succeeded() {
                    warn!(upid = %handle, exit_status = ?status.exit_status, "task stopped with failure");
                }
                debug!(upid = %handle, elapsed = ?started.elapsed(), "task finished");
                return Ok(status);
            }
            if started.elapsed() >= self.timeout {
                return Err(TaskError::Timeout {
                    upid: handle.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            self.pause().await?;
        }
    }

    /// Wait until a host reports no active tasks at all.
    ///
    /// Used after a clone, whose sub-tasks are not exposed individually.
    pub async fn wait_for_host_idle(&self, host: &str) -> TaskResult<()> {
        let started = Instant::now();

        loop {
            let active = self.gateway.active_tasks(host).await?;
            if active.is_empty() {
                debug!(%host, elapsed = ?started.elapsed(), "host has no active tasks");
                return Ok(());
            }
            debug!(%host, active = active.len(), "waiting for host tasks to drain");
            if started.elapsed() >= self.timeout {
                return Err(TaskError::HostBusy {
                    host: host.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            self.pause().await?;
        }
    }

    async fn pause(&self) -> TaskResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => Ok(()),
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::InMemoryHypervisor;
    use forge_core::cancel_pair;

    fn waiter(hv: &Arc<InMemoryHypervisor>) -> TaskWaiter {
        TaskWaiter::new(hv.clone(), "root@pam").with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_stopped() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.set_task_polls(3);
        hv.add_template("hostA", 9010);
        let task = hv.clone_vm("hostA", 9010, 500, "n1").await.unwrap();

        let status = waiter(&hv).wait(&task).await.unwrap();
        assert!(status.succeeded());
        assert_eq!(hv.task_status_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_value_is_rejected() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        let task = TaskRef::Completed(serde_json::Value::Null);
        let err = waiter(&hv).wait(&task).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn error_payload_handle_is_waited_on() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.add_template("hostA", 9010);
        let TaskRef::Handle(upid) = hv.clone_vm("hostA", 9010, 500, "n1").await.unwrap() else {
            panic!("expected a handle");
        };
        let task = TaskRef::Error {
            text: format!("lock timeout, see {upid} for details"),
        };
        let status = waiter(&hv).wait(&task).await.unwrap();
        assert!(status.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.set_task_polls(u32::MAX);
        hv.add_template("hostA", 9010);
        let task = hv.clone_vm("hostA", 9010, 500, "n1").await.unwrap();

        let err = waiter(&hv)
            .with_timeout(Duration::from_millis(100))
            .wait(&task)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.set_task_polls(u32::MAX);
        hv.add_template("hostA", 9010);
        let task = hv.clone_vm("hostA", 9010, 500, "n1").await.unwrap();

        let (handle, signal) = cancel_pair();
        handle.cancel();
        let err = waiter(&hv).with_cancel(signal).wait(&task).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_is_reported_by_wait_success() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.add_template("hostA", 9010);
        hv.fail_tasks_with("clone failed");
        let task = hv.clone_vm("hostA", 9010, 500, "n1").await.unwrap();

        let err = waiter(&hv).wait_success(&task).await.unwrap_err();
        assert!(matches!(err, TaskError::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn host_idle_drains_active_tasks() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.set_active_task_polls("hostA", 2);

        waiter(&hv).wait_for_host_idle("hostA").await.unwrap();
        assert_eq!(hv.active_task_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn host_idle_outlasts_a_running_clone() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("hostA", 8));
        hv.set_task_polls(4);
        hv.add_template("hostA", 9010);
        hv.clone_vm("hostA", 9010, 500, "n1").await.unwrap();

        assert!(hv.delete_vm("hostA", 500).await.is_err());
        assert_eq!(hv.vm_status(500).as_deref(), Some("stopped"));

        waiter(&hv).wait_for_host_idle("hostA").await.unwrap();
        assert_eq!(hv.active_task_calls(), 5);
        hv.delete_vm("hostA", 500).await.unwrap();
        assert_eq!(hv.vm_status(500), None);
    }
}
