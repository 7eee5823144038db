//! Device construction and wiring
//!
//! Builds adapters from their configuration sections, attaches sink and
//! log observers, registers them and applies `enabled`/`autostart`.

use std::sync::Arc;

use libsynaps_core::devices::rpio::KINCONY_SERVER_MINI;
use libsynaps_core::devices::sen0311::PresenceThresholds;
use libsynaps_core::devices::{DistanceSensor, PinBackend, PresenceSensor, RelayPlatform, VirtualPins};
use libsynaps_core::{
    ConfigNode, CoreError, DeviceAdapter, DeviceEvent, DeviceKind, Observers, SerialLink,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::registry::{Registry, SharedAdapter};
use crate::sinks::{SinkHub, SinkKind};

/// Creates the pin backend of a platform from its configuration
pub type BackendFactory =
    Arc<dyn Fn(&ConfigNode) -> Result<Arc<dyn PinBackend>, CoreError> + Send + Sync>;

/// In-memory pins keyed on the platform `host`
pub fn virtual_backends() -> BackendFactory {
    Arc::new(|config: &ConfigNode| {
        let host = config.require_str("host")?;
        Ok(Arc::new(VirtualPins::new(host)) as Arc<dyn PinBackend>)
    })
}

/// Attach one observer per `mqtt`/`ws` binding found in `sources`
///
/// `mqtt = [{ broker, topic }]` and `ws = [{ endpoint }]`. Bindings resolve
/// their sink by name at delivery time.
pub fn bind_sinks(
    observers: &Observers,
    sources: &[&ConfigNode],
    hub: &Arc<SinkHub>,
) -> Result<usize, CoreError> {
    let mut bound = 0;
    for source in sources {
        for binding in source.get_list("mqtt")? {
            let broker = binding.require_str("broker")?;
            let topic = binding.require_str("topic")?;
            let hub = hub.clone();
            observers.add(move |e: &DeviceEvent| {
                hub.send_device_event(
                    SinkKind::Mqtt,
                    &broker,
                    &topic,
                    &e.device_id,
                    e.event_type(),
                    e.data(),
                );
            });
            bound += 1;
        }
        for binding in source.get_list("ws")? {
            let endpoint = binding.require_str("endpoint")?;
            let hub = hub.clone();
            observers.add(move |e: &DeviceEvent| {
                hub.send_device_event(
                    SinkKind::Ws,
                    &endpoint,
                    "",
                    &e.device_id,
                    e.event_type(),
                    e.data(),
                );
            });
            bound += 1;
        }
    }
    Ok(bound)
}

/// Log every event when any of `sources` sets `log_events = true`
fn bind_log_events(observers: &Observers, sources: &[&ConfigNode]) -> Result<(), CoreError> {
    for source in sources {
        if source.get_bool("log_events", false)? {
            observers.add(|e: &DeviceEvent| {
                info!(device = %e.device_id, event = e.event_type(), data = %e.data(), "Device event");
            });
            return Ok(());
        }
    }
    Ok(())
}

fn thresholds(presence: &ConfigNode) -> Result<PresenceThresholds, CoreError> {
    let hysteresis_count = match presence.get_i64("hysteresis_count")? {
        None => 1,
        Some(n) => u32::try_from(n).map_err(|_| {
            CoreError::InvalidConfig(format!(
                "`{}.hysteresis_count` value `{}` is out of range",
                presence.path(),
                n
            ))
        })?,
    };
    let thresholds = PresenceThresholds {
        threshold_presence: presence.require_f64("threshold_presence")?,
        threshold_absence: presence.require_f64("threshold_absence")?,
        hysteresis_count,
    };
    thresholds.validate()?;
    Ok(thresholds)
}

/// Builds adapters keyed on the configuration `type` tag
#[derive(Clone)]
pub struct DeviceFactory {
    hub: Arc<SinkHub>,
    backends: BackendFactory,
    cancel: watch::Receiver<bool>,
}

impl DeviceFactory {
    pub fn new(hub: Arc<SinkHub>, backends: BackendFactory) -> Self {
        Self {
            hub,
            backends,
            cancel: watch::channel(false).1,
        }
    }

    /// Abandon start options (`enabled`, `autostart`) once `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolves once cancelled; never when the sender is gone
    async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        if cancel.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Construct and wire a `[[sensor]]` entry
    pub async fn create_sensor(&self, config: &ConfigNode) -> Result<SharedAdapter, CoreError> {
        let sensor_type = config.require_str("type")?;
        let kind = match sensor_type.parse::<DeviceKind>() {
            Ok(kind @ (DeviceKind::Sen0395 | DeviceKind::Sen0311)) => kind,
            _ => return Err(CoreError::UnknownDeviceType(sensor_type)),
        };
        let name = config.require_str("name")?;
        let port = config.require_str("port")?;

        // Every field is read before the port is opened
        let presence = match kind {
            DeviceKind::Sen0311 => config.get_node("presence")?,
            _ => None,
        };
        let presence_thresholds = presence.as_ref().map(thresholds).transpose()?;
        let mut sources = vec![config];
        sources.extend(presence.as_ref());

        let link = Arc::new(SerialLink::open(&port).await?);
        let adapter: SharedAdapter = match kind {
            DeviceKind::Sen0311 => Arc::new(DistanceSensor::new(name, link, presence_thresholds)),
            _ => Arc::new(PresenceSensor::new(name, link)),
        };

        bind_log_events(adapter.observers(), &sources)?;
        bind_sinks(adapter.observers(), &sources, &self.hub)?;
        Ok(adapter)
    }

    /// Construct and wire a `[[platform]]` entry
    ///
    /// Platform-level bindings apply to every relay and switch in addition
    /// to the item's own.
    pub fn create_platform(&self, config: &ConfigNode) -> Result<Arc<RelayPlatform>, CoreError> {
        let platform_type = config.require_str("type")?;
        if !platform_type.eq_ignore_ascii_case(KINCONY_SERVER_MINI) {
            return Err(CoreError::UnknownDeviceType(platform_type));
        }
        let backend = (self.backends)(config)?;
        let platform = RelayPlatform::from_config(config, backend)?;
        if let Err(e) = self.bind_platform(&platform, config) {
            platform.release_pins();
            return Err(e);
        }
        Ok(Arc::new(platform))
    }

    fn bind_platform(&self, platform: &RelayPlatform, config: &ConfigNode) -> Result<(), CoreError> {
        for relay in platform.relays() {
            bind_sinks(relay.observers(), &[config, relay.config()], &self.hub)?;
        }
        for switch in platform.switches() {
            bind_sinks(switch.observers(), &[config, switch.config()], &self.hub)?;
        }
        bind_log_events(platform.observers(), &[config])
    }
}

/// Register a sensor and apply its start options
pub async fn register_sensor(
    registry: &Registry,
    factory: &DeviceFactory,
    config: &ConfigNode,
) -> Result<SharedAdapter, CoreError> {
    let name = config.require_str("name")?;
    if registry.contains(&name).await {
        return Err(CoreError::AlreadyRegistered(name));
    }
    let enabled = config.get_bool("enabled", false)?;
    let autostart_enabled = config.get_bool("autostart", false)?;

    let adapter = factory.create_sensor(config).await?;
    if let Err(e) = registry.register(adapter.clone()).await {
        discard(adapter.as_ref()).await;
        return Err(e);
    }
    info!(device = %adapter.id(), "Sensor registered");

    start_options(factory, adapter.as_ref(), enabled, autostart_enabled).await;
    Ok(adapter)
}

/// Start reading and autostart, abandoned as soon as the factory is cancelled
async fn start_options(
    factory: &DeviceFactory,
    adapter: &dyn DeviceAdapter,
    enabled: bool,
    autostart_enabled: bool,
) {
    let startup = async {
        if enabled {
            start_reading(adapter).await;
        }
        if autostart_enabled {
            autostart(adapter).await;
        }
    };
    tokio::select! {
        biased;
        _ = factory.cancelled() => {
            info!(device = %adapter.id(), "Shutting down, start options skipped");
        }
        _ = startup => {}
    }
}

/// Register a platform; `Ok(None)` when it is disabled
pub async fn register_platform(
    registry: &Registry,
    factory: &DeviceFactory,
    config: &ConfigNode,
) -> Result<Option<SharedAdapter>, CoreError> {
    if !config.get_bool("enabled", true)? {
        info!(path = %config.path(), "Platform disabled, skipped");
        return Ok(None);
    }

    let platform = factory.create_platform(config)?;
    if registry.contains(platform.name()).await {
        platform.release_pins();
        return Err(CoreError::AlreadyRegistered(platform.name().to_string()));
    }
    let adapter: SharedAdapter = platform.clone();
    if let Err(e) = registry.register(adapter).await {
        platform.release_pins();
        return Err(e);
    }
    let adapter: SharedAdapter = platform;
    info!(device = %adapter.id(), "Platform registered");
    Ok(Some(adapter))
}

/// Close an adapter that never made it into the registry
async fn discard(adapter: &dyn DeviceAdapter) {
    if let Err(e) = adapter.close().await {
        warn!(device = %adapter.id(), error = %e, "Unregistered device not closed");
    }
}

async fn start_reading(adapter: &dyn DeviceAdapter) {
    let started = match adapter.clear_buffer().await {
        Ok(()) => adapter.start_reading().await,
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        warn!(device = %adapter.id(), error = %e, "Reading not started");
    }
}

/// Start the device unless it already runs; the start is never retried
async fn autostart(adapter: &dyn DeviceAdapter) {
    let id = adapter.id();
    match adapter.is_active().await {
        Ok(true) => info!(device = %id, result = "already_active", "Autostart"),
        Ok(false) => match adapter.activate().await {
            Ok(outcome) if outcome.is_success() => {
                info!(device = %id, result = "started", "Autostart")
            }
            Ok(outcome) => {
                warn!(device = %id, result = "failed", outcome = ?outcome, "Autostart")
            }
            Err(e) => warn!(device = %id, result = "failed", error = %e, "Autostart"),
        },
        Err(e) => warn!(device = %id, result = "failed", error = %e, "Autostart"),
    }
}
