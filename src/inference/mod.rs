//! On-device activity recognition over a sliding window of motion frames.

pub mod classifier;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod stage;
pub mod window;
pub mod worker;

pub use classifier::{argmax_label, ActivityLabel, Classifier, Prediction};
#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;
pub use stage::InferenceStage;
pub use window::{MotionFrame, SlidingWindow, WindowTensor, FRAME_CHANNELS};
pub use worker::{InferenceHandle, InferenceWorker};
