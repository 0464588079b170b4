//! The staged readiness protocol.
//!
//! Each stage is a poll loop: run a probe, and if it is not satisfied yet
//! sleep for the poll interval and try again. A stage gives up with
//! [`ReadinessError::Timeout`] once the stage timeout has elapsed and with
//! [`ReadinessError::Cancelled`] as soon as the cancel signal fires.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use forge_core::{CancelSignal, ReadinessStage};

use crate::error::{ReadinessError, ReadinessResult};

/// Outcome of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending(Pending),
}

/// Why a probe is not satisfied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// Transport or agent error, non-zero exit: the node is still booting.
    Transient(String),
    /// Addresses were listed but none is in a home network. Usually a
    /// misconfiguration rather than a slow boot.
    NoHomeAddress { candidates: usize },
}

#[derive(Debug, Clone)]
pub struct ReadinessProtocol {
    poll_interval: Duration,
    stage_timeout: Duration,
    cancel: CancelSignal,
}

impl ReadinessProtocol {
    pub fn new(poll_interval: Duration, stage_timeout: Duration) -> Self {
        Self {
            poll_interval,
            stage_timeout,
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Poll `probe` until it reports ready.
    pub async fn poll<T, F, Fut>(
        &self,
        subject: &str,
        stage: ReadinessStage,
        mut probe: F,
    ) -> ReadinessResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Probe<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.stage_timeout;
        let mut attempts: u32 = 0;
        let mut warned = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(subject, stage));
            }
            attempts += 1;
            // A probe stuck in flight is dropped at the deadline or on cancel.
            let outcome = tokio::select! {
                outcome = probe() => outcome,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ReadinessError::Timeout {
                        subject: subject.to_string(),
                        stage,
                        elapsed: started.elapsed(),
                    });
                }
                _ = self.cancel.cancelled() => return Err(self.cancelled(subject, stage)),
            };
            match outcome {
                Probe::Ready(value) => {
                    debug!(%subject, %stage, attempts, elapsed = ?started.elapsed(), "stage reached");
                    return Ok(value);
                }
                Probe::Pending(Pending::Transient(reason)) => {
                    debug!(%subject, %stage, %reason, "not ready yet");
                }
                Probe::Pending(Pending::NoHomeAddress { candidates }) => {
                    if !warned {
                        warn!(%subject, candidates, "no address in a home network, check [network] home");
                        warned = true;
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.stage_timeout {
                return Err(ReadinessError::Timeout {
                    subject: subject.to_string(),
                    stage,
                    elapsed,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => return Err(self.cancelled(subject, stage)),
            }
        }
    }

    fn cancelled(&self, subject: &str, stage: ReadinessStage) -> ReadinessError {
        info!(%subject, %stage, "readiness wait cancelled");
        ReadinessError::Cancelled {
            subject: subject.to_string(),
            stage,
        }
    }
}

/// Highest stage reached so far; never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTracker {
    reached: ReadinessStage,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self {
            reached: ReadinessStage::Unreachable,
        }
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `stage`; returns true if this moved the tracker forward.
    pub fn advance(&mut self, stage: ReadinessStage) -> bool {
        if stage > self.reached {
            self.reached = stage;
            true
        } else {
            false
        }
    }

    pub fn reached(&self) -> ReadinessStage {
        self.reached
    }

    pub fn is_ready(&self) -> bool {
        self.reached == ReadinessStage::ServicesReady
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::cancel_pair;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn protocol() -> ReadinessProtocol {
        ReadinessProtocol::new(Duration::from_millis(300), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = protocol()
            .poll("kb1", ReadinessStage::ShellReady, || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Probe::Pending(Pending::Transient("exit 255".to_string()))
                    } else {
                        Probe::Ready(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_stage() {
        let err = protocol()
            .poll("kb1", ReadinessStage::AddressAssigned, || async {
                Probe::<()>::Pending(Pending::NoHomeAddress { candidates: 2 })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReadinessError::Timeout { stage: ReadinessStage::AddressAssigned, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let (handle, signal) = cancel_pair();
        let protocol = protocol().with_cancel(signal);
        let waiter = tokio::spawn(async move {
            protocol
                .poll("kb1", ReadinessStage::AgentOnline, || async {
                    Probe::<()>::Pending(Pending::Transient("agent".to_string()))
                })
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ReadinessError::Cancelled { stage: ReadinessStage::AgentOnline, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_times_out() {
        let started = Instant::now();
        let err = protocol()
            .poll("kb1", ReadinessStage::ServicesReady, || {
                std::future::pending::<Probe<()>>()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReadinessError::Timeout { stage: ReadinessStage::ServicesReady, .. }
        ));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_hung_probe() {
        let (handle, signal) = cancel_pair();
        let protocol = protocol().with_cancel(signal);
        let waiter = tokio::spawn(async move {
            protocol
                .poll("kb1", ReadinessStage::ShellReady, || {
                    std::future::pending::<Probe<()>>()
                })
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            ReadinessError::Cancelled { stage: ReadinessStage::ShellReady, .. }
        ));
    }

    #[test]
    fn tracker_never_regresses() {
        let mut tracker = StageTracker::new();
        assert!(tracker.advance(ReadinessStage::AddressAssigned));
        assert!(!tracker.advance(ReadinessStage::AgentOnline));
        assert_eq!(tracker.reached(), ReadinessStage::AddressAssigned);
        assert!(tracker.advance(ReadinessStage::ServicesReady));
        assert!(tracker.is_ready());
    }
}
