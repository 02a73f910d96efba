//! Poll/execute/report loop.
//!
//! A fixed-interval timer drives polling. At most one task is in flight: a
//! tick that finds the busy flag set does nothing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relay_core::api::{ReportRequest, TaskAssignment};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::RelayApi;
use crate::executor::TaskExecutor;

/// What one poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    PollFailed,
    Ran {
        task_id: String,
        success: bool,
        reported: bool,
    },
}

/// Holds the busy flag until dropped.
pub struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct Runtime {
    api: Arc<dyn RelayApi>,
    executor: Arc<dyn TaskExecutor>,
    busy: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new(api: Arc<dyn RelayApi>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            api,
            executor,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Verifies connectivity and credentials once. Callers treat an error as fatal.
    pub async fn startup(&self) -> anyhow::Result<()> {
        let hb = self.api.heartbeat().await.context("initial heartbeat failed")?;
        info!(server_time_ms = hb.server_time_ms, "connected to daemon");
        Ok(())
    }

    pub fn try_begin(&self) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(Arc::clone(&self.busy)))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ticks until `shutdown` resolves, then waits for the in-flight task.
    pub async fn run<F>(&self, every: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut in_flight: Option<JoinHandle<CycleOutcome>> = None;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    let Some(guard) = self.try_begin() else {
                        debug!("task in flight, skipping poll");
                        continue;
                    };
                    let rt = self.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let _guard = guard;
                        rt.run_cycle().await
                    }));
                }
            }
        }

        if let Some(handle) = in_flight {
            if !handle.is_finished() {
                info!("waiting for in-flight task before exit");
            }
            if let Err(e) = handle.await {
                error!("poll cycle aborted: {e}");
            }
        }
    }

    /// Poll once; if a task arrives, execute it and report the outcome.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let assignment = match self.api.poll().await {
            Ok(Some(a)) => a,
            Ok(None) => return CycleOutcome::Idle,
            Err(e) => {
                warn!("poll failed: {e:#}");
                return CycleOutcome::PollFailed;
            }
        };
        info!(task_id = %assignment.task_id, kind = ?assignment.kind, target_id = %assignment.target_id, "task received");

        let report = self.execute(&assignment).await;
        let success = report.success;
        match &report.error {
            Some(err) => warn!(task_id = %assignment.task_id, error = %err, "task failed"),
            None => info!(task_id = %assignment.task_id, "task succeeded"),
        }

        // Best effort: an unreported task is recycled by the daemon's stale-claim sweep.
        let reported = match self.api.report(&assignment.task_id, &report).await {
            Ok(ack) => {
                debug!(task_id = %assignment.task_id, status = %ack.status, "report accepted");
                true
            }
            Err(e) => {
                error!(task_id = %assignment.task_id, "report failed: {e:#}");
                false
            }
        };

        CycleOutcome::Ran {
            task_id: assignment.task_id,
            success,
            reported,
        }
    }

    async fn execute(&self, assignment: &TaskAssignment) -> ReportRequest {
        let payload = match assignment.decode_payload() {
            Ok(p) => p,
            Err(e) => return ReportRequest::failed(e.to_string()),
        };

        let executor = Arc::clone(&self.executor);
        let run = tokio::spawn(async move { executor.execute(payload).await });
        match run.await {
            Ok(Ok(details)) => ReportRequest::succeeded(Some(details)),
            Ok(Err(e)) => ReportRequest::failed(format!("{e:#}")),
            Err(e) => ReportRequest::failed(format!("executor crashed: {e}")),
        }
    }
}
