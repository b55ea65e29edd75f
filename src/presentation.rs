//! Presentation adapter: folds collector events into a snapshot any UI can watch.

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::{
    db::{Attitude, Axes, Channel},
    events::CollectorEvent,
    inference::Prediction,
};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveSnapshot {
    pub recording: bool,
    pub session_id: Option<String>,
    pub accelerometer: Option<Axes>,
    pub gyroscope: Option<Axes>,
    pub magnetometer: Option<Axes>,
    pub rotation_rate: Option<Axes>,
    pub user_acceleration: Option<Axes>,
    pub attitude: Option<Attitude>,
    pub battery: Option<f64>,
    pub prediction: Prediction,
    pub readings: u64,
    /// Events skipped because this view fell behind.
    pub missed: u64,
}

pub fn apply(snapshot: &mut LiveSnapshot, event: &CollectorEvent) {
    match event {
        CollectorEvent::Started { session_id } => {
            *snapshot = LiveSnapshot {
                recording: true,
                session_id: Some(session_id.clone()),
                missed: snapshot.missed,
                ..LiveSnapshot::default()
            };
        }
        CollectorEvent::Reading(reading) => {
            snapshot.readings += 1;
            snapshot.battery = (reading.battery >= 0.0).then_some(reading.battery);
            match reading.source {
                Channel::Accelerometer => snapshot.accelerometer = Some(reading.axes),
                Channel::Gyroscope => snapshot.gyroscope = Some(reading.axes),
                Channel::Magnetometer => snapshot.magnetometer = Some(reading.axes),
                Channel::DeviceMotion => {
                    snapshot.rotation_rate = Some(reading.axes);
                    snapshot.user_acceleration = reading.user_acceleration;
                    snapshot.attitude = reading.attitude;
                }
            }
        }
        CollectorEvent::Prediction(prediction) => snapshot.prediction = prediction.clone(),
        CollectorEvent::Stopped { .. } => snapshot.recording = false,
    }
}

pub struct LiveView {
    receiver: watch::Receiver<LiveSnapshot>,
    worker: JoinHandle<()>,
}

impl LiveView {
    pub fn spawn(mut events: broadcast::Receiver<CollectorEvent>) -> Self {
        let (sender, receiver) = watch::channel(LiveSnapshot::default());

        let worker = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => sender.send_modify(|snapshot| apply(snapshot, &event)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        sender.send_modify(|snapshot| snapshot.missed += skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { receiver, worker }
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LiveSnapshot> {
        self.receiver.clone()
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::Reading, inference::ActivityLabel};
    use chrono::Utc;
    use uuid::Uuid;

    fn reading(source: Channel, x: f64) -> Reading {
        let motion = source == Channel::DeviceMotion;
        Reading {
            id: Uuid::new_v4(),
            session_id: "s".into(),
            timestamp: Utc::now(),
            source,
            axes: Axes::new(x, 0.0, 0.0),
            user_acceleration: motion.then(|| Axes::new(0.0, x, 0.0)),
            attitude: motion.then_some(Attitude {
                pitch: x,
                roll: 0.0,
                yaw: 0.0,
            }),
            battery: -1.0,
        }
    }

    #[test]
    fn test_apply_mirrors_latest_values() {
        let mut snapshot = LiveSnapshot::default();
        apply(&mut snapshot, &CollectorEvent::Started { session_id: "s".into() });
        apply(&mut snapshot, &CollectorEvent::Reading(reading(Channel::Accelerometer, 1.0)));
        apply(&mut snapshot, &CollectorEvent::Reading(reading(Channel::Accelerometer, 2.0)));
        apply(&mut snapshot, &CollectorEvent::Reading(reading(Channel::DeviceMotion, 3.0)));

        assert!(snapshot.recording);
        assert_eq!(snapshot.readings, 3);
        assert_eq!(snapshot.accelerometer.map(|a| a.x), Some(2.0));
        assert_eq!(snapshot.attitude.map(|a| a.pitch), Some(3.0));
        assert_eq!(snapshot.battery, None, "unknown battery is not shown");
        assert!(snapshot.gyroscope.is_none());

        apply(
            &mut snapshot,
            &CollectorEvent::Stopped {
                session_id: "s".into(),
                samples: 3,
            },
        );
        assert!(!snapshot.recording);
        assert_eq!(snapshot.readings, 3);
    }

    #[test]
    fn test_new_session_resets_values() {
        let mut snapshot = LiveSnapshot::default();
        apply(&mut snapshot, &CollectorEvent::Reading(reading(Channel::Gyroscope, 1.0)));
        apply(&mut snapshot, &CollectorEvent::Started { session_id: "next".into() });

        assert_eq!(snapshot.session_id.as_deref(), Some("next"));
        assert!(snapshot.gyroscope.is_none());
        assert_eq!(snapshot.readings, 0);
    }

    #[tokio::test]
    async fn test_view_follows_broadcast() {
        let (events, rx) = broadcast::channel(16);
        let view = LiveView::spawn(rx);
        let mut watch = view.watch();

        events
            .send(CollectorEvent::Prediction(Prediction::Activity {
                label: ActivityLabel::Walk,
                confidence: 0.9,
                scores: vec![0.0, 0.0, 0.9, 0.1, 0.0, 0.0],
            }))
            .unwrap();
        watch.changed().await.unwrap();

        assert_eq!(view.snapshot().prediction.label(), Some(ActivityLabel::Walk));
    }
}
