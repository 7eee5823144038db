//! DFRobot SEN0311 ultrasonic distance sensor
//!
//! The sensor streams 4-byte frames `0xFF, H, L, SUM` where the distance in
//! millimetres is `H * 256 + L` and `SUM` is the low byte of the sum of the
//! first three bytes. Presence is derived from the distance with thresholds
//! and hysteresis.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapter::{ConfigSnapshot, DeviceAdapter, StatusSnapshot};
use crate::devices::{PresenceTracker, ReadingSlot};
use crate::error::{AdapterError, CoreError};
use crate::link::SensorLink;
use crate::observer::Observers;
use crate::types::command::CommandOutcome;
use crate::types::device::{DeviceId, DeviceKind};

const FRAME_HEADER: u8 = 0xFF;
const FRAME_TIMEOUT: Duration = Duration::from_millis(300);
/// Bytes skipped while looking for a frame header before giving up this round
const MAX_SYNC_BYTES: usize = 16;

/// Distance in millimetres, or `None` when the checksum does not match
pub fn decode_frame(frame: [u8; 4]) -> Option<u32> {
    if frame[0] != FRAME_HEADER {
        return None;
    }
    let sum = frame[0].wrapping_add(frame[1]).wrapping_add(frame[2]);
    if sum != frame[3] {
        return None;
    }
    Some(u32::from(frame[1]) * 256 + u32::from(frame[2]))
}

/// Threshold presence detection
///
/// A distance at or below `threshold_presence` votes for presence, at or
/// above `threshold_absence` for absence; anything between keeps the current
/// state. A new state is accepted after `hysteresis_count` consecutive votes.
#[derive(Debug, Clone)]
pub struct PresenceThresholds {
    pub threshold_presence: f64,
    pub threshold_absence: f64,
    pub hysteresis_count: u32,
}

impl PresenceThresholds {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.threshold_presence > self.threshold_absence {
            return Err(CoreError::InvalidConfig(format!(
                "threshold_presence ({}) must not exceed threshold_absence ({})",
                self.threshold_presence, self.threshold_absence
            )));
        }
        if self.hysteresis_count == 0 {
            return Err(CoreError::InvalidConfig(
                "hysteresis_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct HysteresisFilter {
    thresholds: PresenceThresholds,
    state: Option<bool>,
    pending: Option<bool>,
    count: u32,
}

impl HysteresisFilter {
    fn new(thresholds: PresenceThresholds) -> Self {
        Self {
            thresholds,
            state: None,
            pending: None,
            count: 0,
        }
    }

    /// Feed one distance; returns the new state when it flips
    fn feed(&mut self, distance: u32) -> Option<bool> {
        let distance = f64::from(distance);
        let vote = if distance <= self.thresholds.threshold_presence {
            true
        } else if distance >= self.thresholds.threshold_absence {
            false
        } else {
            self.pending = None;
            self.count = 0;
            return None;
        };

        if self.state == Some(vote) {
            self.pending = None;
            self.count = 0;
            return None;
        }

        if self.pending == Some(vote) {
            self.count += 1;
        } else {
            self.pending = Some(vote);
            self.count = 1;
        }

        if self.count >= self.thresholds.hysteresis_count {
            self.state = Some(vote);
            self.pending = None;
            self.count = 0;
            return Some(vote);
        }
        None
    }
}

struct DistanceState {
    measurement: Mutex<Option<u32>>,
    filter: Option<Mutex<HysteresisFilter>>,
    tracker: PresenceTracker,
}

impl DistanceState {
    fn on_distance(&self, distance: u32) {
        *self.measurement.lock().unwrap_or_else(|e| e.into_inner()) = Some(distance);
        let Some(filter) = &self.filter else {
            return;
        };
        let flipped = filter.lock().unwrap_or_else(|e| e.into_inner()).feed(distance);
        if let Some(presence) = flipped {
            self.tracker.update(presence);
        }
    }
}

pub struct DistanceSensor {
    name: String,
    link: Arc<dyn SensorLink>,
    observers: Observers,
    state: Arc<DistanceState>,
    reading: ReadingSlot,
    interval: Duration,
}

impl DistanceSensor {
    /// Default pause between two readings
    pub const READ_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(
        name: impl Into<String>,
        link: Arc<dyn SensorLink>,
        thresholds: Option<PresenceThresholds>,
    ) -> Self {
        let name = name.into();
        let observers = Observers::new();
        let device_id = DeviceId::new(DeviceKind::Sen0311, name.clone()).to_string();
        Self {
            name,
            link,
            state: Arc::new(DistanceState {
                measurement: Mutex::new(None),
                filter: thresholds.map(|t| Mutex::new(HysteresisFilter::new(t))),
                tracker: PresenceTracker::new(device_id, observers.clone()),
            }),
            observers,
            reading: ReadingSlot::default(),
            interval: Self::READ_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn measurement(&self) -> Option<u32> {
        *self.state.measurement.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read the next valid frame, resynchronising on the header byte
async fn read_distance(link: &dyn SensorLink) -> Result<Option<u32>, AdapterError> {
    for _ in 0..MAX_SYNC_BYTES {
        let Some(header) = link.read_exact(1, FRAME_TIMEOUT).await? else {
            return Ok(None);
        };
        if header[0] != FRAME_HEADER {
            continue;
        }
        let Some(body) = link.read_exact(3, FRAME_TIMEOUT).await? else {
            return Ok(None);
        };
        return Ok(decode_frame([FRAME_HEADER, body[0], body[1], body[2]]));
    }
    Ok(None)
}

#[async_trait]
impl DeviceAdapter for DistanceSensor {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Sen0311
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observers(&self) -> &Observers {
        &self.observers
    }

    async fn send_command(
        &self,
        command: &str,
        _args: &[String],
    ) -> Result<CommandOutcome, AdapterError> {
        Err(AdapterError::UnknownCommand(command.to_string()))
    }

    async fn status(&self) -> Result<StatusSnapshot, AdapterError> {
        Ok(StatusSnapshot::new(self.id(), self.reading.is_running())
            .with("port", self.link.port())
            .with("measurement", self.measurement())
            .with("presence", self.state.tracker.current()))
    }

    async fn config(&self) -> Result<ConfigSnapshot, AdapterError> {
        let mut snapshot = ConfigSnapshot::new(self.id())
            .with("read_interval_ms", self.interval.as_millis() as u64);
        if let Some(filter) = &self.state.filter {
            let thresholds = filter
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .thresholds
                .clone();
            snapshot = snapshot
                .with("threshold_presence", thresholds.threshold_presence)
                .with("threshold_absence", thresholds.threshold_absence)
                .with("hysteresis_count", thresholds.hysteresis_count);
        }
        Ok(snapshot)
    }

    async fn start_reading(&self) -> Result<(), AdapterError> {
        let link = self.link.clone();
        let state = self.state.clone();
        let name = self.name.clone();
        let interval = self.interval;

        self.reading.start_with(move |mut stop_rx| {
            tokio::spawn(async move {
                debug!(sensor = %name, "Reading started");
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        distance = read_distance(link.as_ref()) => match distance {
                            Ok(Some(distance)) => state.on_distance(distance),
                            Ok(None) => {}
                            Err(AdapterError::Closed(_)) => break,
                            Err(e) => warn!(sensor = %name, error = %e, "Read failed"),
                        }
                    }
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                debug!(sensor = %name, "Reading stopped");
            })
        });
        Ok(())
    }

    async fn stop_reading(&self) -> Result<(), AdapterError> {
        self.reading.stop().await;
        Ok(())
    }

    async fn clear_buffer(&self) -> Result<(), AdapterError> {
        self.link.clear_buffer().await
    }

    async fn is_active(&self) -> Result<bool, AdapterError> {
        Ok(self.reading.is_running())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.reading.stop().await;
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::ScriptedLink;
    use crate::types::event::{DeviceEvent, EventKind};

    fn frame(distance: u16) -> [u8; 4] {
        let h = (distance >> 8) as u8;
        let l = (distance & 0xFF) as u8;
        [0xFF, h, l, 0xFFu8.wrapping_add(h).wrapping_add(l)]
    }

    fn thresholds(hysteresis_count: u32) -> PresenceThresholds {
        PresenceThresholds {
            threshold_presence: 1000.0,
            threshold_absence: 1500.0,
            hysteresis_count,
        }
    }

    #[test]
    fn test_decode_frame() {
        assert_eq!(decode_frame(frame(1234)), Some(1234));
        let mut bad = frame(1234);
        bad[3] = bad[3].wrapping_add(1);
        assert_eq!(decode_frame(bad), None);
        assert_eq!(decode_frame([0x00, 0x01, 0x02, 0x03]), None);
    }

    #[test]
    fn test_hysteresis() {
        let mut filter = HysteresisFilter::new(thresholds(2));
        assert_eq!(filter.feed(500), None);
        assert_eq!(filter.feed(500), Some(true));
        assert_eq!(filter.feed(500), None);
        // Dead band keeps the state and resets pending votes
        assert_eq!(filter.feed(2000), None);
        assert_eq!(filter.feed(1200), None);
        assert_eq!(filter.feed(2000), None);
        assert_eq!(filter.feed(2000), Some(false));
    }

    #[test]
    fn test_thresholds_validation() {
        assert!(thresholds(1).validate().is_ok());
        assert!(thresholds(0).validate().is_err());
        let inverted = PresenceThresholds {
            threshold_presence: 2000.0,
            threshold_absence: 1000.0,
            hysteresis_count: 1,
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn test_reading_updates_measurement_and_presence() {
        let link = Arc::new(ScriptedLink::new());
        link.push_bytes(&[0x12]);
        link.push_bytes(&frame(600));

        let sensor = DistanceSensor::new("door", link.clone(), Some(thresholds(1)))
            .with_interval(Duration::from_millis(5));
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            sensor.observers().add(move |e: &DeviceEvent| {
                events.lock().unwrap().push(e.clone());
            });
        }

        sensor.start_reading().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sensor.stop_reading().await.unwrap();

        assert_eq!(sensor.measurement(), Some(600));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id, "sen0311/door");
        assert_eq!(events[0].kind, EventKind::PresenceChange { presence: true });
    }

    #[tokio::test]
    async fn test_commands_not_supported() {
        let link = Arc::new(ScriptedLink::new());
        let sensor = DistanceSensor::new("door", link, None);
        assert!(matches!(
            sensor.send_command("sensorStart", &[]).await,
            Err(AdapterError::UnknownCommand(_))
        ));
    }
}
