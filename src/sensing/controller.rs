use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use log::{error, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::CollectorConfig,
    db::{Channel, Database, Session, SessionStatus},
    events::CollectorEvent,
    inference::{Classifier, InferenceStage, InferenceWorker},
    platform::Platform,
    sink::PersistenceSink,
};

use super::loop_worker::{sampling_loop, LoopContext, LoopOutcome};
use super::source::MotionSource;

struct ActiveRun {
    session_id: String,
    channels: Vec<Channel>,
    cancel_token: CancellationToken,
    handle: JoinHandle<LoopOutcome>,
    inference: Option<InferenceWorker>,
    /// Sink drop counter when the run began.
    dropped_before: u64,
}

struct CollectorState {
    /// `None` while a run owns it.
    source: Option<Box<dyn MotionSource>>,
    classifier: Option<Box<dyn Classifier>>,
    run: Option<ActiveRun>,
}

/// Starts and stops sampling runs. Cheap to clone; clones share the same hardware.
#[derive(Clone)]
pub struct Collector {
    state: Arc<Mutex<CollectorState>>,
    running: Arc<AtomicBool>,
    events: broadcast::Sender<CollectorEvent>,
    config: Arc<CollectorConfig>,
    db: Database,
    sink: PersistenceSink,
    platform: Platform,
}

impl Collector {
    pub fn new(
        source: Box<dyn MotionSource>,
        classifier: Option<Box<dyn Classifier>>,
        config: Arc<CollectorConfig>,
        db: Database,
        sink: PersistenceSink,
        platform: Platform,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            state: Arc::new(Mutex::new(CollectorState {
                source: Some(source),
                classifier,
                run: None,
            })),
            running: Arc::new(AtomicBool::new(false)),
            events,
            config,
            db,
            sink,
            platform,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn sink(&self) -> &PersistenceSink {
        &self.sink
    }

    /// Opens every channel the hardware grants and starts sampling. Returns the new session id.
    ///
    /// A denied channel is logged and skipped; the run continues with the rest.
    pub async fn start(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.run.is_some() {
            bail!("collection already active");
        }
        let Some(mut source) = state.source.take() else {
            bail!("motion source unavailable");
        };

        let session_id = Uuid::new_v4().to_string();
        let started_at = self.platform.clock.now();
        if let Err(err) = self
            .db
            .insert_session(&Session::start(session_id.clone(), started_at))
            .await
        {
            state.source = Some(source);
            return Err(err.context("failed to record session start"));
        }

        source.set_update_interval(self.config.sample_interval());
        let mut channels = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            match source.start(channel) {
                Ok(()) => channels.push(channel),
                Err(err) => warn!("{channel:?} unavailable, sampling without it: {err:#}"),
            }
        }
        if channels.is_empty() {
            warn!("no motion channel could be opened, session {session_id} will stay empty");
        }

        // every run gets a fresh window
        let inference = match state.classifier.take() {
            Some(classifier) => {
                let stage = InferenceStage::new(
                    classifier,
                    self.config.window_capacity,
                    self.config.inference_stride,
                );
                match InferenceWorker::spawn(stage, self.events.clone()) {
                    Ok(worker) => Some(worker),
                    Err(err) => {
                        error!("inference disabled for session {session_id}: {err:#}");
                        None
                    }
                }
            }
            None => None,
        };

        let ctx = LoopContext {
            session_id: session_id.clone(),
            interval: self.config.sample_interval(),
            sink: self.sink.clone(),
            events: self.events.clone(),
            platform: self.platform.clone(),
            inference: inference.as_ref().map(InferenceWorker::handle),
        };
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(source, ctx, cancel_token.clone()));

        state.run = Some(ActiveRun {
            session_id: session_id.clone(),
            channels,
            cancel_token,
            handle,
            inference,
            dropped_before: self.sink.stats().dropped,
        });
        self.running.store(true, Ordering::SeqCst);

        let _ = self.events.send(CollectorEvent::Started {
            session_id: session_id.clone(),
        });
        info!(
            "Collection started: session {session_id} at {} Hz",
            self.config.sample_rate_hz
        );
        Ok(session_id)
    }

    /// Stops the current run and waits until its last reading is committed.
    ///
    /// The session's `sample_count` is the number of readings that reached the store. A run
    /// whose sampling task died is finished as `Interrupted`.
    ///
    /// Safe to call when idle or from several tasks at once: only the first caller sees the
    /// finished session, the rest get `None`.
    pub async fn stop(&self) -> Result<Option<Session>> {
        let mut state = self.state.lock().await;
        let Some(run) = state.run.take() else {
            return Ok(None);
        };
        self.running.store(false, Ordering::SeqCst);
        run.cancel_token.cancel();

        let (samples, status) = match run.handle.await {
            Ok(mut outcome) => {
                for channel in &run.channels {
                    outcome.source.stop(*channel);
                }
                state.source = Some(outcome.source);
                (outcome.samples, SessionStatus::Completed)
            }
            Err(err) => {
                error!(
                    "sampling loop for session {} failed to join, motion source lost: {err}",
                    run.session_id
                );
                (0, SessionStatus::Interrupted)
            }
        };

        if let Some(worker) = run.inference {
            match worker.shutdown().await {
                Ok(classifier) => state.classifier = Some(classifier),
                Err(err) => error!("inference worker failed to shut down: {err:#}"),
            }
        }

        if let Err(err) = self.sink.flush().await {
            error!("final flush for session {} failed: {err:#}", run.session_id);
        }

        let _ = self.events.send(CollectorEvent::Stopped {
            session_id: run.session_id.clone(),
            samples,
        });

        let dropped = self.sink.stats().dropped.saturating_sub(run.dropped_before);
        if dropped > 0 {
            warn!(
                "session {}: {dropped} of {samples} readings never reached the store",
                run.session_id
            );
        }
        let stored = samples.saturating_sub(dropped);

        let stopped_at = self.platform.clock.now();
        let status_label = status.as_str();
        self.db
            .finish_session(&run.session_id, status, stored, stopped_at)
            .await?;
        info!(
            "Collection stopped: session {} ({status_label}) with {stored} readings",
            run.session_id
        );

        self.db.get_session(&run.session_id).await
    }
}
