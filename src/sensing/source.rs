use std::{
    collections::{HashMap, HashSet, VecDeque},
    f64::consts::TAU,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::db::{Attitude, Axes, Channel};

/// Latest value of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelSample {
    /// Accelerometer (g), gyroscope (rad/s) or magnetometer (µT).
    Vector(Axes),
    Motion {
        rotation_rate: Axes,
        user_acceleration: Axes,
        attitude: Attitude,
    },
}

impl ChannelSample {
    /// Primary triple: the vector itself, or rotation rate for device motion.
    pub fn axes(&self) -> Axes {
        match self {
            ChannelSample::Vector(axes) => *axes,
            ChannelSample::Motion { rotation_rate, .. } => *rotation_rate,
        }
    }
}

/// Motion hardware.
///
/// Channels are opened and closed individually; `latest` returns `None` when a channel is
/// closed or has nothing to report on this tick.
pub trait MotionSource: Send {
    fn set_update_interval(&mut self, interval: Duration);
    fn start(&mut self, channel: Channel) -> Result<()>;
    fn stop(&mut self, channel: Channel);
    fn latest(&mut self, channel: Channel) -> Option<ChannelSample>;
}

const GRAVITY_Z: f64 = -1.0;
const STEP_HZ: f64 = 1.8;

/// Synthetic walking signal for hosts without motion hardware.
pub struct SimulatedMotionSource {
    rng: StdRng,
    open: HashSet<Channel>,
    origin: Instant,
    interval: Duration,
    noise: f64,
}

impl SimulatedMotionSource {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            open: HashSet::new(),
            origin: Instant::now(),
            interval: Duration::from_millis(20),
            noise: 0.02,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn jitter(&mut self) -> f64 {
        self.rng.gen_range(-self.noise..=self.noise)
    }

    fn sample_at(&mut self, channel: Channel, t: f64) -> ChannelSample {
        let phase = TAU * STEP_HZ * t;
        match channel {
            Channel::Accelerometer => ChannelSample::Vector(Axes::new(
                0.08 * phase.sin() + self.jitter(),
                0.04 * (phase * 0.5).sin() + self.jitter(),
                GRAVITY_Z + 0.25 * phase.sin().abs() + self.jitter(),
            )),
            Channel::Gyroscope => ChannelSample::Vector(Axes::new(
                0.6 * phase.cos() + self.jitter(),
                0.3 * (phase * 0.5).cos() + self.jitter(),
                0.1 * phase.sin() + self.jitter(),
            )),
            Channel::Magnetometer => ChannelSample::Vector(Axes::new(
                22.0 + 2.0 * (phase * 0.1).sin() + self.jitter(),
                -4.5 + self.jitter(),
                -41.0 + 1.5 * (phase * 0.1).cos() + self.jitter(),
            )),
            Channel::DeviceMotion => ChannelSample::Motion {
                rotation_rate: Axes::new(
                    0.6 * phase.cos() + self.jitter(),
                    0.3 * (phase * 0.5).cos() + self.jitter(),
                    0.1 * phase.sin() + self.jitter(),
                ),
                user_acceleration: Axes::new(
                    0.08 * phase.sin() + self.jitter(),
                    0.04 * (phase * 0.5).sin() + self.jitter(),
                    0.25 * phase.sin().abs() + self.jitter(),
                ),
                attitude: Attitude {
                    pitch: 0.6 + 0.05 * phase.sin(),
                    roll: 0.02 * phase.cos(),
                    yaw: 0.01 * t,
                },
            },
        }
    }
}

impl Default for SimulatedMotionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionSource for SimulatedMotionSource {
    fn set_update_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    fn start(&mut self, channel: Channel) -> Result<()> {
        if self.open.is_empty() {
            self.origin = Instant::now();
        }
        self.open.insert(channel);
        Ok(())
    }

    fn stop(&mut self, channel: Channel) {
        self.open.remove(&channel);
    }

    fn latest(&mut self, channel: Channel) -> Option<ChannelSample> {
        if !self.open.contains(&channel) {
            return None;
        }
        let t = self.origin.elapsed().as_secs_f64();
        Some(self.sample_at(channel, t))
    }
}

/// Plays back queued samples, one per `latest` call per channel.
///
/// An exhausted channel reports nothing, which is how gaps show up. Channels listed with
/// `deny` fail to open.
#[derive(Default)]
pub struct ReplayMotionSource {
    queued: HashMap<Channel, VecDeque<ChannelSample>>,
    open: HashSet<Channel>,
    denied: HashSet<Channel>,
    interval: Option<Duration>,
}

impl ReplayMotionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: Channel, sample: ChannelSample) {
        self.queued.entry(channel).or_default().push_back(sample);
    }

    pub fn deny(&mut self, channel: Channel) {
        self.denied.insert(channel);
    }

    pub fn remaining(&self, channel: Channel) -> usize {
        self.queued.get(&channel).map_or(0, VecDeque::len)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_open(&self, channel: Channel) -> bool {
        self.open.contains(&channel)
    }
}

impl MotionSource for ReplayMotionSource {
    fn set_update_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    fn start(&mut self, channel: Channel) -> Result<()> {
        if self.denied.contains(&channel) {
            bail!("{channel:?} access denied");
        }
        self.open.insert(channel);
        Ok(())
    }

    fn stop(&mut self, channel: Channel) {
        self.open.remove(&channel);
    }

    fn latest(&mut self, channel: Channel) -> Option<ChannelSample> {
        if !self.open.contains(&channel) {
            return None;
        }
        self.queued.get_mut(&channel)?.pop_front()
    }
}
