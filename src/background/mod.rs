//! Extended background execution: submitting requests, running a collection under a grant,
//! and settling the grant on expiration or user stop.

pub mod local;
pub mod manager;
pub mod state;

pub use local::{drive_grants, LocalScheduler, LocalTask};
pub use manager::{BackgroundManager, TaskSnapshot};
pub use state::{TaskOutcome, TaskState, TaskStatus};
