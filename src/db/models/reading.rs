//! Reading data model.
//!
//! One timestamped observation from one motion channel, in the shape it is persisted and
//! exported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One motion-sensor data stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    /// Fused device motion: rotation rate, user acceleration and attitude.
    DeviceMotion,
}

impl Channel {
    /// Sampling order within one tick.
    pub const ALL: [Channel; 4] = [
        Channel::Accelerometer,
        Channel::Gyroscope,
        Channel::Magnetometer,
        Channel::DeviceMotion,
    ];

    /// Single-letter tag written to the `source` column.
    pub fn code(&self) -> &'static str {
        match self {
            Channel::Accelerometer => "A",
            Channel::Gyroscope => "G",
            Channel::Magnetometer => "M",
            Channel::DeviceMotion => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Channel::Accelerometer),
            "G" => Some(Channel::Gyroscope),
            "M" => Some(Channel::Magnetometer),
            "D" => Some(Channel::DeviceMotion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Axes {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Attitude {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: Uuid,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Channel,
    /// Acceleration, rotation rate or magnetic field; rotation rate for device motion.
    pub axes: Axes,
    /// Present only for device-motion rows.
    pub user_acceleration: Option<Axes>,
    /// Present only for device-motion rows.
    pub attitude: Option<Attitude>,
    /// Battery level in `0.0..=1.0`, or `-1.0` when the platform cannot tell.
    pub battery: f64,
}

/// A reading as read back from the store, with its insertion sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub seq: i64,
    pub reading: Reading,
}
