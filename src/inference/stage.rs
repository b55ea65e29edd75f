use log::warn;

use super::{
    classifier::{argmax_label, Classifier, Prediction},
    window::{MotionFrame, SlidingWindow},
};

/// Feeds frames through the sliding window and runs the classifier every `stride` frames
/// once the window is full.
pub struct InferenceStage {
    window: SlidingWindow<MotionFrame>,
    stride: usize,
    since_last: usize,
    classifier: Box<dyn Classifier>,
    latest: Prediction,
    invocations: u64,
}

impl InferenceStage {
    pub fn new(classifier: Box<dyn Classifier>, capacity: usize, stride: usize) -> Self {
        Self {
            window: SlidingWindow::new(capacity),
            stride: stride.max(1),
            since_last: 0,
            classifier,
            latest: Prediction::Pending,
            invocations: 0,
        }
    }

    /// Returns the new prediction when this frame triggered a classifier run.
    pub fn observe(&mut self, frame: MotionFrame) -> Option<&Prediction> {
        self.window.push(frame);
        self.since_last = self.since_last.saturating_add(1);
        if !self.window.is_full() || self.since_last < self.stride {
            return None;
        }
        self.since_last = 0;
        self.invocations += 1;

        let tensor = self.window.to_tensor();
        let outcome = self.classifier.predict(&tensor).and_then(|scores| {
            let (label, confidence) = argmax_label(&scores)?;
            Ok(Prediction::Activity {
                label,
                confidence,
                scores,
            })
        });

        self.latest = match outcome {
            Ok(prediction) => prediction,
            Err(err) => {
                warn!("activity inference failed: {err:#}");
                Prediction::Failed {
                    error: format!("{err:#}"),
                    last_label: self.latest.label(),
                }
            }
        };
        Some(&self.latest)
    }

    pub fn latest(&self) -> &Prediction {
        &self.latest
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn window(&self) -> &SlidingWindow<MotionFrame> {
        &self.window
    }

    pub fn into_classifier(self) -> Box<dyn Classifier> {
        self.classifier
    }
}
