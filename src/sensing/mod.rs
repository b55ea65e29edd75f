//! Motion sampling: hardware abstraction, the sampling loop and its start/stop controller.

pub mod controller;
pub mod loop_worker;
pub mod source;

pub use controller::Collector;
pub use source::{ChannelSample, MotionSource, ReplayMotionSource, SimulatedMotionSource};
