//! In-process stand-in for the host's background scheduler.
//!
//! `LocalScheduler` grants every accepted request right away through a channel;
//! `drive_grants` turns those into `LocalTask`s for a `BackgroundManager` and can expire them
//! after a deadline, the way the host would.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::platform::{BackgroundScheduler, GrantedTask, SubmissionStrategy, TaskRequest};

use super::BackgroundManager;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct LocalScheduler {
    pending: Mutex<Vec<TaskRequest>>,
    grants: mpsc::UnboundedSender<TaskRequest>,
}

impl LocalScheduler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskRequest>) {
        let (grants, receiver) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            grants,
        });
        (scheduler, receiver)
    }

    /// A granted request stops being pending.
    fn mark_granted(&self, identifier: &str) {
        lock(&self.pending).retain(|request| request.identifier != identifier);
    }
}

impl BackgroundScheduler for LocalScheduler {
    fn pending_requests(&self) -> Vec<String> {
        lock(&self.pending)
            .iter()
            .map(|request| request.identifier.clone())
            .collect()
    }

    fn submit(&self, request: TaskRequest) -> Result<()> {
        let mut pending = lock(&self.pending);
        let duplicate = pending.iter().any(|p| p.identifier == request.identifier);
        if duplicate && request.strategy == SubmissionStrategy::Fail {
            bail!("request {} is already pending", request.identifier);
        }
        pending.push(request.clone());
        drop(pending);

        if self.grants.send(request).is_err() {
            bail!("local scheduler is no longer granting tasks");
        }
        Ok(())
    }

    fn cancel_all(&self) {
        lock(&self.pending).clear();
    }
}

#[derive(Debug, Default)]
struct TaskRecord {
    title: (String, String),
    completion: Option<bool>,
}

/// A grant that records what the manager reports to it.
pub struct LocalTask {
    identifier: String,
    completed_units: AtomicU64,
    total_units: AtomicU64,
    completion_calls: AtomicU64,
    record: Mutex<TaskRecord>,
}

impl LocalTask {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            completed_units: AtomicU64::new(0),
            total_units: AtomicU64::new(0),
            completion_calls: AtomicU64::new(0),
            record: Mutex::new(TaskRecord::default()),
        }
    }

    pub fn completed_units(&self) -> u64 {
        self.completed_units.load(Ordering::SeqCst)
    }

    pub fn total_units(&self) -> u64 {
        self.total_units.load(Ordering::SeqCst)
    }

    pub fn title(&self) -> (String, String) {
        lock(&self.record).title.clone()
    }

    /// The first reported result.
    pub fn completion(&self) -> Option<bool> {
        lock(&self.record).completion
    }

    pub fn completion_calls(&self) -> u64 {
        self.completion_calls.load(Ordering::SeqCst)
    }
}

impl GrantedTask for LocalTask {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn update_progress(&self, completed: u64, total: u64) {
        self.completed_units.store(completed, Ordering::SeqCst);
        self.total_units.store(total, Ordering::SeqCst);
    }

    fn update_title(&self, title: &str, subtitle: &str) {
        lock(&self.record).title = (title.to_string(), subtitle.to_string());
    }

    fn set_completed(&self, success: bool) {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        let mut record = lock(&self.record);
        if record.completion.is_none() {
            record.completion = Some(success);
        }
    }
}

/// Delivers grants to `manager` until cancelled or the scheduler is dropped.
///
/// Cancellation is only observed between grants, so a grant being handed over always finishes.
/// With `expire_after`, each grant still unfinished at the deadline is expired.
pub async fn drive_grants(
    manager: BackgroundManager,
    scheduler: Arc<LocalScheduler>,
    mut grants: mpsc::UnboundedReceiver<TaskRequest>,
    expire_after: Option<Duration>,
    cancel_token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            request = grants.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        scheduler.mark_granted(&request.identifier);
        let task = Arc::new(LocalTask::new(&request.identifier));
        info!("granting {} ({})", request.identifier, request.title);

        if let Err(err) = manager.handle_grant(task.clone()).await {
            error!("grant for {} failed: {err:#}", request.identifier);
            continue;
        }

        if let Some(deadline) = expire_after {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if task.completion().is_none() {
                    if let Err(err) = manager.handle_expiration().await {
                        error!("expiration handling failed: {err:#}");
                    }
                }
            });
        }
    }
}
