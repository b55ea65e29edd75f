use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::window::WindowTensor;

/// Output vocabulary, in the model's class-index order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLabel {
    Sit,
    Stand,
    Walk,
    ClimbUp,
    ClimbDown,
    Run,
}

impl ActivityLabel {
    pub const ALL: [ActivityLabel; 6] = [
        ActivityLabel::Sit,
        ActivityLabel::Stand,
        ActivityLabel::Walk,
        ActivityLabel::ClimbUp,
        ActivityLabel::ClimbDown,
        ActivityLabel::Run,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLabel::Sit => "sit",
            ActivityLabel::Stand => "stand",
            ActivityLabel::Walk => "walk",
            ActivityLabel::ClimbUp => "climb_up",
            ActivityLabel::ClimbDown => "climb_down",
            ActivityLabel::Run => "run",
        }
    }
}

/// A pre-trained activity model: one score per `ActivityLabel`, in `ALL` order.
pub trait Classifier: Send {
    fn predict(&mut self, input: &WindowTensor) -> Result<Vec<f32>>;
}

/// Picks the highest-scoring class. Ties go to the lower index.
pub fn argmax_label(scores: &[f32]) -> Result<(ActivityLabel, f32)> {
    if scores.len() != ActivityLabel::ALL.len() {
        bail!(
            "classifier returned {} scores, expected {}",
            scores.len(),
            ActivityLabel::ALL.len()
        );
    }
    if let Some(bad) = scores.iter().find(|score| !score.is_finite()) {
        bail!("classifier returned non-finite score {bad}");
    }

    let (index, score) = scores
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, s)| {
            if s > best.1 {
                (i, s)
            } else {
                best
            }
        });

    match ActivityLabel::from_index(index) {
        Some(label) => Ok((label, score)),
        None => bail!("class index {index} out of range"),
    }
}

/// Latest classification state as seen by callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Prediction {
    /// The window has not filled yet.
    #[default]
    Pending,
    Activity {
        label: ActivityLabel,
        confidence: f32,
        scores: Vec<f32>,
    },
    Failed {
        error: String,
        /// Label from the last successful run, if any.
        last_label: Option<ActivityLabel>,
    },
}

impl Prediction {
    pub fn label(&self) -> Option<ActivityLabel> {
        match self {
            Prediction::Pending => None,
            Prediction::Activity { label, .. } => Some(*label),
            Prediction::Failed { last_label, .. } => *last_label,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Prediction::Failed { .. })
    }
}
