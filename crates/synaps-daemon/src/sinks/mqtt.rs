//! MQTT broker sink using rumqttc

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libsynaps_core::{ConfigNode, CoreError};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Sink, SinkKind};
use crate::error::DaemonError;

pub const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

/// Settings of one `[[broker]]` entry
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

impl BrokerConfig {
    pub fn from_config(config: &ConfigNode) -> Result<Self, CoreError> {
        let name = config.require_str("name")?;
        let host = config.require_str("host")?;
        let port = match config.get_i64("port")? {
            None => DEFAULT_PORT,
            Some(p) => u16::try_from(p).map_err(|_| {
                CoreError::InvalidConfig(format!("`{}.port` value `{}` is out of range", config.path(), p))
            })?,
        };
        Ok(Self {
            name,
            host,
            port,
            enabled: config.get_bool("enabled", true)?,
        })
    }
}

pub struct MqttSink {
    config: BrokerConfig,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    /// Create the client and start polling its event loop
    ///
    /// The connection is established in the background; events published
    /// before the broker acknowledges are dropped.
    pub fn connect(config: BrokerConfig, shutdown: watch::Receiver<bool>) -> Self {
        let mut options = MqttOptions::new(config.name.clone(), config.host.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        info!(broker = %config.name, host = %config.host, port = config.port, "Connecting to MQTT broker");

        let handle = {
            let connected = connected.clone();
            let name = config.name.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.changed() => break,
                        event = event_loop.poll() => event,
                    };
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            connected.store(true, Ordering::SeqCst);
                            info!(broker = %name, "MQTT connected");
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            connected.store(false, Ordering::SeqCst);
                            info!(broker = %name, "MQTT disconnected");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if connected.swap(false, Ordering::SeqCst) {
                                warn!(broker = %name, error = %e, "MQTT connection lost");
                            } else {
                                debug!(broker = %name, error = %e, "MQTT connection failed");
                            }
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            })
        };

        Self {
            config,
            client,
            connected,
            event_loop: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Mqtt
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, target: &str, payload: &str) -> Result<(), DaemonError> {
        if !self.is_connected() {
            return Err(DaemonError::NotConnected(self.config.name.clone()));
        }
        self.client
            .try_publish(target, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| DaemonError::Sink(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), DaemonError> {
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        if self.is_connected() {
            info!(broker = %self.config.name, "Disconnecting from MQTT broker");
            self.client
                .disconnect()
                .await
                .map_err(|e| DaemonError::Sink(e.to_string()))?;
            // The loop ends once the disconnect packet went out
            let _ = handle.await;
        } else {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
