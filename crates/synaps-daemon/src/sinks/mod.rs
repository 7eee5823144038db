//! Notification sinks
//!
//! Device observers hand events to the [`SinkHub`], which resolves the sink
//! by name at publish time and delivers fire-and-forget. An event for a sink
//! that is missing or unreachable is dropped; one warning is logged when the
//! sink becomes unreachable and none again until a delivery succeeds.

pub mod mqtt;
pub mod ws;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use libsynaps_core::CoreError;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::DaemonError;

pub use mqtt::MqttSink;
pub use ws::WsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Mqtt,
    Ws,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Mqtt => "mqtt",
            SinkKind::Ws => "ws",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Hand `payload` off for delivery to `target` (topic); never blocks
    fn publish(&self, target: &str, payload: &str) -> Result<(), DaemonError>;

    async fn disconnect(&self) -> Result<(), DaemonError>;
}

pub type SharedSink = Arc<dyn Sink>;

type SinkKey = (SinkKind, String);

/// Body of every event delivered to a sink
pub fn event_payload(device_id: &str, event: &str, data: Value) -> Value {
    json!({
        "deviceId": device_id,
        "event": event,
        "eventAt": chrono::Utc::now().to_rfc3339(),
        "eventData": data,
    })
}

#[derive(Default)]
pub struct SinkHub {
    sinks: RwLock<HashMap<SinkKey, SharedSink>>,
    unreachable: Mutex<HashSet<SinkKey>>,
}

impl SinkHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: SharedSink) -> Result<(), CoreError> {
        let key = (sink.kind(), sink.name().to_string());
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        if sinks.contains_key(&key) {
            return Err(CoreError::AlreadyRegistered(format!("{} {}", key.0, key.1)));
        }
        sinks.insert(key, sink);
        Ok(())
    }

    pub fn contains(&self, kind: SinkKind, name: &str) -> bool {
        self.sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(kind, name.to_string()))
    }

    pub fn get(&self, kind: SinkKind, name: &str) -> Option<SharedSink> {
        self.sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every sink of `kind`
    pub fn drain_kind(&self, kind: SinkKind) -> Vec<SharedSink> {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<SinkKey> = sinks.keys().filter(|k| k.0 == kind).cloned().collect();
        keys.iter().filter_map(|k| sinks.remove(k)).collect()
    }

    /// Build the event payload and publish it; returns whether it was handed off
    pub fn send_device_event(
        &self,
        kind: SinkKind,
        sink: &str,
        topic: &str,
        device_id: &str,
        event: &str,
        data: Value,
    ) -> bool {
        let key = (kind, sink.to_string());
        let Some(target) = self.get(kind, sink) else {
            self.mark_unreachable(key, "missing");
            return false;
        };

        let payload = event_payload(device_id, event, data).to_string();
        match target.publish(topic, &payload) {
            Ok(()) => {
                self.unreachable
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                debug!(sink = %sink, kind = %kind, topic, %payload, "Device event published");
                true
            }
            Err(e) => {
                self.mark_unreachable(key, &e.to_string());
                false
            }
        }
    }

    fn mark_unreachable(&self, key: SinkKey, reason: &str) {
        let first = self
            .unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        if first {
            warn!(sink = %key.1, kind = %key.0, reason, "Sink unreachable, events dropped");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording sink used by daemon tests

    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    pub struct RecordingSink {
        pub kind: SinkKind,
        pub name: String,
        pub connected: AtomicBool,
        pub published: Mutex<Vec<(String, Value)>>,
        pub fail_disconnect: bool,
    }

    impl RecordingSink {
        pub fn new(kind: SinkKind, name: &str) -> Self {
            Self {
                kind,
                name: name.to_string(),
                connected: AtomicBool::new(true),
                published: Mutex::new(Vec::new()),
                fail_disconnect: false,
            }
        }

        pub fn published(&self) -> Vec<(String, Value)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn kind(&self) -> SinkKind {
            self.kind
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn publish(&self, target: &str, payload: &str) -> Result<(), DaemonError> {
            if !self.is_connected() {
                return Err(DaemonError::NotConnected(self.name.clone()));
            }
            let value: Value = serde_json::from_str(payload).unwrap();
            self.published
                .lock()
                .unwrap()
                .push((target.to_string(), value));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), DaemonError> {
            self.connected.store(false, Ordering::SeqCst);
            if self.fail_disconnect {
                Err(DaemonError::Sink("disconnect failed".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
