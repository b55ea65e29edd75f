use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use tokio::sync::broadcast;

use crate::events::CollectorEvent;

use super::{
    classifier::Classifier,
    stage::InferenceStage,
    window::MotionFrame,
};

enum InferenceCommand {
    Frame(MotionFrame),
    Shutdown,
}

/// Cheap handle the sampling loop uses to hand frames to the inference thread.
#[derive(Clone)]
pub struct InferenceHandle {
    sender: mpsc::Sender<InferenceCommand>,
}

impl InferenceHandle {
    pub fn push(&self, frame: MotionFrame) {
        if self.sender.send(InferenceCommand::Frame(frame)).is_err() {
            error!("inference thread gone, dropping frame");
        }
    }
}

/// Owns an `InferenceStage` on a dedicated thread so model calls never stall sampling.
pub struct InferenceWorker {
    sender: mpsc::Sender<InferenceCommand>,
    worker: JoinHandle<Box<dyn Classifier>>,
}

impl InferenceWorker {
    pub fn spawn(
        mut stage: InferenceStage,
        events: broadcast::Sender<CollectorEvent>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<InferenceCommand>();

        let worker = thread::Builder::new()
            .name("motion-inference".into())
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    match command {
                        InferenceCommand::Frame(frame) => {
                            if let Some(prediction) = stage.observe(frame) {
                                let _ = events.send(CollectorEvent::Prediction(prediction.clone()));
                            }
                        }
                        InferenceCommand::Shutdown => break,
                    }
                }

                info!(
                    "Inference thread shutting down after {} classifier runs",
                    stage.invocations()
                );
                stage.into_classifier()
            })
            .with_context(|| "failed to spawn inference worker thread")?;

        Ok(Self { sender, worker })
    }

    pub fn handle(&self) -> InferenceHandle {
        InferenceHandle {
            sender: self.sender.clone(),
        }
    }

    /// Drains queued frames, stops the thread and hands the classifier back.
    pub async fn shutdown(self) -> Result<Box<dyn Classifier>> {
        let _ = self.sender.send(InferenceCommand::Shutdown);
        let worker = self.worker;
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .context("inference join task failed")?
            .map_err(|_| anyhow!("inference thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ActivityLabel, SlidingWindow, WindowTensor};

    struct Fixed;

    impl Classifier for Fixed {
        fn predict(&mut self, _input: &WindowTensor) -> Result<Vec<f32>> {
            Ok(vec![0.0, 0.9, 0.0, 0.0, 0.0, 0.1])
        }
    }

    #[tokio::test]
    async fn test_worker_publishes_predictions() {
        let (events, mut rx) = broadcast::channel(16);
        let worker = InferenceWorker::spawn(InferenceStage::new(Box::new(Fixed), 4, 4), events)
            .unwrap();
        let handle = worker.handle();

        for n in 0..8 {
            handle.push([n as f32; 6]);
        }
        worker.shutdown().await.unwrap();

        let mut labels = Vec::new();
        while let Ok(CollectorEvent::Prediction(prediction)) = rx.try_recv() {
            labels.push(prediction.label());
        }
        assert_eq!(labels, vec![Some(ActivityLabel::Stand); 2]);
    }

    #[tokio::test]
    async fn test_shutdown_returns_classifier() {
        let (events, _rx) = broadcast::channel(4);
        let worker = InferenceWorker::spawn(InferenceStage::new(Box::new(Fixed), 60, 60), events)
            .unwrap();

        let mut classifier = worker.shutdown().await.unwrap();
        let scores = classifier
            .predict(&SlidingWindow::<MotionFrame>::new(60).to_tensor())
            .unwrap();
        assert_eq!(scores.len(), 6);
    }
}
