pub mod reading;
pub mod session;

pub use reading::{Attitude, Axes, Channel, Reading, StoredReading};
pub use session::{Session, SessionStatus};
