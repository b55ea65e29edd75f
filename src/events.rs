use serde::Serialize;

use crate::{db::Reading, inference::Prediction};

/// Everything the collector publishes. Presentation layers subscribe instead of sharing
/// mutable fields with the sampling loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollectorEvent {
    Started { session_id: String },
    Reading(Reading),
    Prediction(Prediction),
    Stopped { session_id: String, samples: u64 },
}
