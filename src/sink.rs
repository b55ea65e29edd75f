//! Batched persistence for readings.
//!
//! `save` never waits: readings are queued to a single writer task that commits them to the
//! store in batches of `save_threshold`. A failed commit is logged and its batch dropped.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::db::{Database, Reading};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

enum SinkCommand {
    Save(Reading),
    Flush(oneshot::Sender<Result<usize>>),
}

#[derive(Default)]
struct SinkCounters {
    saved: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub saved: u64,
    pub committed: u64,
    pub dropped: u64,
}

impl SinkStats {
    /// Saved but neither committed nor dropped yet.
    pub fn pending(&self) -> u64 {
        self.saved
            .saturating_sub(self.committed)
            .saturating_sub(self.dropped)
    }
}

#[derive(Clone)]
pub struct PersistenceSink {
    sender: mpsc::UnboundedSender<SinkCommand>,
    counters: Arc<SinkCounters>,
}

impl PersistenceSink {
    /// Starts the writer task on the current tokio runtime.
    pub fn spawn(db: Database, save_threshold: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(SinkCounters::default());
        tokio::spawn(sink_worker(
            db,
            save_threshold.max(1),
            receiver,
            counters.clone(),
        ));
        Self { sender, counters }
    }

    pub fn save(&self, reading: Reading) {
        self.counters.saved.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(SinkCommand::Save(reading)).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log_error!("persistence sink stopped, reading dropped");
        }
    }

    /// Commits whatever is buffered and reports how many rows were written.
    pub async fn flush(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(SinkCommand::Flush(reply_tx))
            .map_err(|_| anyhow!("persistence sink stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("persistence sink terminated during flush"))?
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            saved: self.counters.saved.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn sink_worker(
    db: Database,
    threshold: usize,
    mut receiver: mpsc::UnboundedReceiver<SinkCommand>,
    counters: Arc<SinkCounters>,
) {
    let mut pending: Vec<Reading> = Vec::with_capacity(threshold);

    while let Some(command) = receiver.recv().await {
        match command {
            SinkCommand::Save(reading) => {
                pending.push(reading);
                if pending.len() >= threshold {
                    let _ = commit(&db, &mut pending, threshold, &counters).await;
                }
            }
            SinkCommand::Flush(reply) => {
                let result = commit(&db, &mut pending, threshold, &counters).await;
                let _ = reply.send(result);
            }
        }
    }

    if !pending.is_empty() {
        log_warn!("persistence sink closing with {} buffered readings", pending.len());
        let _ = commit(&db, &mut pending, threshold, &counters).await;
    }
    log_info!("persistence sink shutting down");
}

async fn commit(
    db: &Database,
    pending: &mut Vec<Reading>,
    threshold: usize,
    counters: &SinkCounters,
) -> Result<usize> {
    if pending.is_empty() {
        return Ok(0);
    }
    let batch = std::mem::replace(pending, Vec::with_capacity(threshold));
    let size = batch.len();

    match db.insert_readings(batch).await {
        Ok(written) => {
            counters.committed.fetch_add(written as u64, Ordering::Relaxed);
            Ok(written)
        }
        Err(err) => {
            counters.dropped.fetch_add(size as u64, Ordering::Relaxed);
            log_error!("batch commit of {size} readings failed, dropping batch: {err:#}");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Axes, Channel, Session};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn reading(session_id: &str, n: i64) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            timestamp: Utc::now() + Duration::milliseconds(n * 20),
            source: Channel::Accelerometer,
            axes: Axes::new(0.0, 0.0, -1.0),
            user_acceleration: None,
            attitude: None,
            battery: 0.5,
        }
    }

    async fn setup() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("motion.sqlite3")).unwrap();
        db.insert_session(&Session::start("s".into(), Utc::now()))
            .await
            .unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_commits_when_threshold_reached() {
        let (_dir, db) = setup().await;
        let sink = PersistenceSink::spawn(db.clone(), 5);

        for n in 0..4 {
            sink.save(reading("s", n));
        }
        assert_eq!(db.count_readings().await.unwrap(), 0);

        sink.save(reading("s", 4));
        // the fifth save already committed the batch, so nothing is left to flush
        assert_eq!(sink.flush().await.unwrap(), 0);
        assert_eq!(db.count_readings().await.unwrap(), 5);
        assert_eq!(sink.stats().committed, 5);
    }

    #[tokio::test]
    async fn test_flush_commits_partial_batch() {
        let (_dir, db) = setup().await;
        let sink = PersistenceSink::spawn(db.clone(), 500);

        for n in 0..7 {
            sink.save(reading("s", n));
        }
        assert_eq!(sink.flush().await.unwrap(), 7);
        assert_eq!(db.count_readings().await.unwrap(), 7);

        let stats = sink.stats();
        assert_eq!(stats.saved, 7);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_not_retried() {
        let (_dir, db) = setup().await;
        let sink = PersistenceSink::spawn(db.clone(), 3);

        // unknown session violates the foreign key, so the whole batch fails
        sink.save(reading("s", 0));
        sink.save(reading("missing", 1));
        sink.save(reading("s", 2));
        sink.save(reading("s", 3));

        assert_eq!(sink.flush().await.unwrap(), 1);
        assert_eq!(db.count_readings().await.unwrap(), 1);

        let stats = sink.stats();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.pending(), 0);
    }
}
