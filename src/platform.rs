//! Host capabilities the collector depends on.
//!
//! Everything the pipeline needs from the device (wall clock, battery gauge, diagnostic
//! notifications, the background-execution scheduler) is reached through these traits and
//! injected at construction.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that advances by a fixed step on every read, for deterministic replays.
pub struct SteppingClock {
    start: DateTime<Utc>,
    step: Duration,
    reads: AtomicU64,
}

impl SteppingClock {
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            start,
            step,
            reads: AtomicU64::new(0),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let n = i32::try_from(self.reads.fetch_add(1, Ordering::SeqCst)).unwrap_or(i32::MAX);
        self.step
            .checked_mul(n)
            .and_then(|offset| self.start.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

pub trait BatteryMonitor: Send + Sync {
    /// Charge in `0.0..=1.0`, or `-1.0` when unknown.
    fn level(&self) -> f64;
}

/// Battery gauge for hosts without one, or for tests.
pub struct StaticBattery {
    bits: AtomicU64,
}

impl StaticBattery {
    pub const UNKNOWN: f64 = -1.0;

    pub fn new(level: f64) -> Self {
        Self {
            bits: AtomicU64::new(level.to_bits()),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn set(&self, level: f64) {
        self.bits.store(level.to_bits(), Ordering::Relaxed);
    }
}

impl BatteryMonitor for StaticBattery {
    fn level(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Fire-and-forget diagnostic channel.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

pub const NOTIFICATION_TITLE: &str = "BGTask Log";

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!("[{NOTIFICATION_TITLE}] {message}");
    }
}

/// Keeps every message; handy when a test needs to assert on diagnostics.
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, message: &str) {
        let mut guard = match self.messages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(message.to_string());
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionStrategy {
    /// Reject the request when it cannot run right away.
    Fail,
    /// Queue the request behind others.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub identifier: String,
    pub title: String,
    pub subtitle: String,
    pub strategy: SubmissionStrategy,
}

/// The host's background-execution scheduler.
///
/// `submit` must not call back into the caller synchronously; grants arrive later through
/// `BackgroundManager::handle_grant`.
pub trait BackgroundScheduler: Send + Sync {
    fn pending_requests(&self) -> Vec<String>;
    fn submit(&self, request: TaskRequest) -> Result<()>;
    fn cancel_all(&self);
}

/// One grant of extended execution.
pub trait GrantedTask: Send + Sync {
    fn identifier(&self) -> &str;
    fn update_progress(&self, completed: u64, total: u64);
    fn update_title(&self, title: &str, subtitle: &str);
    fn set_completed(&self, success: bool);
}

/// Capabilities shared by the collector and its workers.
#[derive(Clone)]
pub struct Platform {
    pub clock: Arc<dyn Clock>,
    pub battery: Arc<dyn BatteryMonitor>,
    pub notifier: Arc<dyn Notifier>,
}

impl Platform {
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            battery: Arc::new(StaticBattery::unknown()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stepping_clock_advances_per_read() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = SteppingClock::new(start, Duration::milliseconds(20));

        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start + Duration::milliseconds(20));
        assert_eq!(clock.now(), start + Duration::milliseconds(40));
    }

    #[test]
    fn test_stepping_clock_saturates_instead_of_overflowing() {
        let clock = SteppingClock::new(Utc::now(), Duration::days(1));
        clock.reads.store(u64::MAX - 1, Ordering::SeqCst);

        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_static_battery_updates() {
        let battery = StaticBattery::unknown();
        assert_eq!(battery.level(), -1.0);
        battery.set(0.42);
        assert_eq!(battery.level(), 0.42);
    }

    #[test]
    fn test_memory_notifier_keeps_order() {
        let notifier = MemoryNotifier::default();
        notifier.notify("one");
        notifier.notify("two");
        assert_eq!(notifier.messages(), vec!["one", "two"]);
    }
}
