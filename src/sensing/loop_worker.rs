use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    db::{Channel, Reading},
    events::CollectorEvent,
    inference::{InferenceHandle, MotionFrame},
    platform::Platform,
    sink::PersistenceSink,
};

use super::source::{ChannelSample, MotionSource};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Everything a sampling run writes to.
pub struct LoopContext {
    pub session_id: String,
    pub interval: Duration,
    pub sink: PersistenceSink,
    pub events: broadcast::Sender<CollectorEvent>,
    pub platform: Platform,
    pub inference: Option<InferenceHandle>,
}

/// Handed back when the loop exits so the next run can reuse the hardware.
pub struct LoopOutcome {
    pub source: Box<dyn MotionSource>,
    pub samples: u64,
}

pub async fn sampling_loop(
    mut source: Box<dyn MotionSource>,
    ctx: LoopContext,
    cancel_token: CancellationToken,
) -> LoopOutcome {
    let mut ticker = tokio::time::interval(ctx.interval);
    // a late tick is dropped rather than replayed in a burst
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut samples = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("sampling loop for session {} shutting down after {samples} readings", ctx.session_id);
                break;
            }
            _ = ticker.tick() => {
                samples += sample_tick(source.as_mut(), &ctx);
            }
        }
    }

    LoopOutcome { source, samples }
}

/// One tick: every channel with a fresh sample becomes a reading. Returns how many.
pub fn sample_tick(source: &mut dyn MotionSource, ctx: &LoopContext) -> u64 {
    let timestamp = ctx.platform.clock.now();
    let battery = ctx.platform.battery.level();

    let mut accel = None;
    let mut gyro = None;
    let mut produced = 0;

    for channel in Channel::ALL {
        let Some(sample) = source.latest(channel) else {
            continue;
        };
        match channel {
            Channel::Accelerometer => accel = Some(sample.axes()),
            Channel::Gyroscope => gyro = Some(sample.axes()),
            _ => {}
        }

        let reading = to_reading(&ctx.session_id, timestamp, channel, sample, battery);
        let _ = ctx.events.send(CollectorEvent::Reading(reading.clone()));
        ctx.sink.save(reading);
        produced += 1;
    }

    if let (Some(inference), Some(a), Some(g)) = (&ctx.inference, accel, gyro) {
        let frame: MotionFrame = [
            a.x as f32, a.y as f32, a.z as f32, g.x as f32, g.y as f32, g.z as f32,
        ];
        inference.push(frame);
    } else if produced > 0 && ctx.inference.is_some() {
        log_debug!("tick without accelerometer and gyroscope pair, no frame for inference");
    }

    produced
}

fn to_reading(
    session_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    source: Channel,
    sample: ChannelSample,
    battery: f64,
) -> Reading {
    let (user_acceleration, attitude) = match sample {
        ChannelSample::Vector(_) => (None, None),
        ChannelSample::Motion {
            user_acceleration,
            attitude,
            ..
        } => (Some(user_acceleration), Some(attitude)),
    };
    Reading {
        id: Uuid::new_v4(),
        session_id: session_id.to_string(),
        timestamp,
        source,
        axes: sample.axes(),
        user_acceleration,
        attitude,
        battery,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{Attitude, Axes, Database, Session},
        platform::{MemoryNotifier, StaticBattery, SteppingClock},
        sensing::source::ReplayMotionSource,
    };
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn platform() -> Platform {
        Platform {
            clock: Arc::new(SteppingClock::new(
                Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
                chrono::Duration::milliseconds(20),
            )),
            battery: Arc::new(StaticBattery::new(0.75)),
            notifier: Arc::new(MemoryNotifier::default()),
        }
    }

    async fn context() -> (tempfile::TempDir, Database, LoopContext, broadcast::Receiver<CollectorEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("motion.sqlite3")).unwrap();
        db.insert_session(&Session::start("run".into(), Utc::now()))
            .await
            .unwrap();
        let (events, rx) = broadcast::channel(64);
        let ctx = LoopContext {
            session_id: "run".into(),
            interval: Duration::from_millis(5),
            sink: PersistenceSink::spawn(db.clone(), 500),
            events,
            platform: platform(),
            inference: None,
        };
        (dir, db, ctx, rx)
    }

    #[tokio::test]
    async fn test_tick_skips_channels_without_fresh_samples() {
        let (_dir, db, ctx, mut rx) = context().await;
        let mut source = ReplayMotionSource::new();
        for channel in Channel::ALL {
            source.start(channel).unwrap();
        }
        source.push(Channel::Accelerometer, ChannelSample::Vector(Axes::new(0.0, 0.0, -1.0)));
        source.push(
            Channel::DeviceMotion,
            ChannelSample::Motion {
                rotation_rate: Axes::new(0.1, 0.2, 0.3),
                user_acceleration: Axes::new(0.01, 0.02, 0.03),
                attitude: Attitude {
                    pitch: 0.5,
                    roll: 0.0,
                    yaw: 1.0,
                },
            },
        );

        assert_eq!(sample_tick(&mut source, &ctx), 2);
        assert_eq!(sample_tick(&mut source, &ctx), 0);

        let mut sources = Vec::new();
        while let Ok(CollectorEvent::Reading(reading)) = rx.try_recv() {
            assert_eq!(reading.battery, 0.75);
            sources.push(reading.source);
        }
        assert_eq!(sources, vec![Channel::Accelerometer, Channel::DeviceMotion]);

        ctx.sink.flush().await.unwrap();
        assert_eq!(db.count_readings().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_loop_returns_source_on_cancel() {
        let (_dir, _db, ctx, _rx) = context().await;
        let mut source = ReplayMotionSource::new();
        source.start(Channel::Gyroscope).unwrap();
        for n in 0..3 {
            source.push(Channel::Gyroscope, ChannelSample::Vector(Axes::new(n as f64, 0.0, 0.0)));
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(Box::new(source), ctx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.samples, 3);
    }
}
