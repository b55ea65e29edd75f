use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use log::{error, info, warn};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{debug_mode, CollectorConfig},
    db::Session,
    platform::{
        BackgroundScheduler, Clock, GrantedTask, Notifier, SubmissionStrategy, TaskRequest,
    },
    sensing::Collector,
};

use super::{TaskOutcome, TaskState, TaskStatus};

pub const REQUEST_TITLE: &str = "Sensor Data Collection";
pub const REQUEST_SUBTITLE: &str = "Collecting environmental metrics...";
pub const RUNNING_TITLE: &str = "Collecting Data";
pub const RUNNING_SUBTITLE: &str = "Running...";

/// Progress total reported to the host; the run has no natural end.
pub const LIVENESS_TOTAL: u64 = i64::MAX as u64;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub liveness: u64,
    pub collecting: bool,
}

struct Heartbeat {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.handle.await;
    }
}

struct ManagerInner {
    state: TaskState,
    /// Taken exactly once by whichever of expiration or user stop completes it.
    task: Option<Arc<dyn GrantedTask>>,
    heartbeat: Option<Heartbeat>,
}

/// Keeps a collection alive through a host grant of extended background execution.
#[derive(Clone)]
pub struct BackgroundManager {
    inner: Arc<Mutex<ManagerInner>>,
    collector: Collector,
    scheduler: Arc<dyn BackgroundScheduler>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    identifier: String,
    liveness_interval: Duration,
    heartbeat_log_every: u64,
    liveness: Arc<AtomicU64>,
}

impl BackgroundManager {
    pub fn new(
        collector: Collector,
        scheduler: Arc<dyn BackgroundScheduler>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &CollectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                state: TaskState::new(),
                task: None,
                heartbeat: None,
            })),
            collector,
            scheduler,
            notifier,
            clock,
            identifier: config.background_task_identifier.clone(),
            liveness_interval: config.liveness_interval(),
            heartbeat_log_every: if debug_mode() { 1 } else { 10 },
            liveness: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub async fn status(&self) -> TaskStatus {
        self.inner.lock().await.state.status
    }

    pub async fn outcome(&self) -> Option<TaskOutcome> {
        self.inner.lock().await.state.outcome
    }

    pub fn liveness(&self) -> u64 {
        self.liveness.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> TaskSnapshot {
        let state = self.inner.lock().await.state.clone();
        TaskSnapshot {
            state,
            liveness: self.liveness(),
            collecting: self.collector.is_running(),
        }
    }

    /// Asks the scheduler for a grant unless one is already outstanding.
    ///
    /// Returns `false` when the request was skipped as a duplicate.
    pub async fn submit(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        let pending = self
            .scheduler
            .pending_requests()
            .iter()
            .any(|id| id == &self.identifier);
        if inner.state.status.is_active() || pending {
            self.notifier
                .notify("Background task already scheduled. Skipping new submission.");
            return Ok(false);
        }

        let request = TaskRequest {
            identifier: self.identifier.clone(),
            title: REQUEST_TITLE.to_string(),
            subtitle: REQUEST_SUBTITLE.to_string(),
            strategy: SubmissionStrategy::Fail,
        };
        match self.scheduler.submit(request) {
            Ok(()) => {
                inner.state.submitted();
                self.notifier.notify(&format!(
                    "Submitted {} at {}",
                    self.identifier,
                    self.clock.now().to_rfc3339()
                ));
                Ok(true)
            }
            Err(err) => {
                self.notifier.notify(&format!("Submission failed: {err}"));
                Err(err)
            }
        }
    }

    /// Entry point for a grant: starts collecting and the liveness heartbeat.
    pub async fn handle_grant(&self, task: Arc<dyn GrantedTask>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.task.is_some() {
                warn!("grant for {} while another is running, refusing it", task.identifier());
                task.set_completed(false);
                bail!("background task already running");
            }
            if !inner.state.status.accepts_grant() {
                info!(
                    "grant for {} arrived after the request was settled ({:?}), declining it",
                    task.identifier(),
                    inner.state.status
                );
                task.set_completed(false);
                return Ok(());
            }
            inner.state.begin(self.clock.now());
            inner.task = Some(task.clone());
        }
        self.liveness.store(0, Ordering::SeqCst);
        self.notifier.notify("Background data collection started.");

        let session_id = match self.collector.start().await {
            Ok(session_id) => session_id,
            Err(err) => {
                self.notifier
                    .notify(&format!("Background collection failed to start: {err:#}"));
                let mut inner = self.inner.lock().await;
                if let Some(task) = inner.task.take() {
                    inner.state.fail(self.clock.now());
                    task.set_completed(false);
                }
                return Err(err);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.state.status != TaskStatus::Running {
            // expired or stopped while the collector was starting
            drop(inner);
            info!("grant ended before collection settled, stopping session {session_id}");
            if let Err(err) = self.collector.stop().await {
                error!("failed to stop collector after early grant end: {err:#}");
            }
            return Ok(());
        }
        inner.state.session_id = Some(session_id);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(heartbeat(
            task,
            self.liveness.clone(),
            self.liveness_interval,
            self.heartbeat_log_every,
            cancel_token.clone(),
        ));
        inner.heartbeat = Some(Heartbeat {
            cancel_token,
            handle,
        });
        Ok(())
    }

    /// The host is ending the grant. Always stops collection and reports failure.
    pub async fn handle_expiration(&self) -> Result<()> {
        self.notifier
            .notify("Background task expired, system ended it");

        let (task, heartbeat) = {
            let mut inner = self.inner.lock().await;
            if inner.state.status == TaskStatus::Completed && inner.task.is_none() {
                info!("expiration after the task already completed");
            } else {
                inner.state.expire(self.clock.now());
            }
            (inner.task.take(), inner.heartbeat.take())
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        let stopped = self.collector.stop().await;
        if let Some(task) = task {
            task.set_completed(false);
        }
        self.scheduler.cancel_all();

        stopped.map(|_| ())
    }

    /// User-initiated stop. Returns the finished session, if a run was active.
    ///
    /// A request still waiting for its grant is withdrawn, and a grant that shows up later is
    /// declined.
    pub async fn request_stop(&self) -> Result<Option<Session>> {
        let (task, heartbeat) = {
            let mut inner = self.inner.lock().await;
            match inner.task.take() {
                Some(task) => {
                    inner.state.begin_stop();
                    (task, inner.heartbeat.take())
                }
                None if inner.state.status == TaskStatus::Submitted => {
                    inner.state.withdraw(self.clock.now());
                    drop(inner);
                    self.scheduler.cancel_all();
                    self.notifier.notify("Cancelled pending background request.");
                    return Ok(None);
                }
                None => {
                    drop(inner);
                    self.notifier.notify("No background task running.");
                    return Ok(None);
                }
            }
        };
        self.notifier
            .notify("Stopping background collection manually.");

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        let stopped = self.collector.stop().await;

        let success = self.inner.lock().await.state.finish_stop(self.clock.now());
        task.set_completed(success);
        self.scheduler.cancel_all();
        if !success {
            warn!("user stop overtaken by expiration, task reported as failed");
        }

        stopped
    }
}

async fn heartbeat(
    task: Arc<dyn GrantedTask>,
    liveness: Arc<AtomicU64>,
    interval: Duration,
    log_every: u64,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let beats = liveness.fetch_add(1, Ordering::SeqCst) + 1;
                task.update_progress(beats, LIVENESS_TOTAL);
                task.update_title(RUNNING_TITLE, RUNNING_SUBTITLE);
                if beats % log_every.max(1) == 0 {
                    info!("{} alive, beat {beats}", task.identifier());
                }
            }
        }
    }
}
