//! Daemon lifecycle
//!
//! `Stopped -> Binding -> Initializing -> Running -> ShuttingDown -> Stopped`.
//!
//! The API endpoint is bound first so a second instance exits before it
//! touches any device. Initialisation and shutdown fan out over every
//! branch concurrently; a failing unit is logged and never stops its
//! siblings.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use libsynaps_core::{paths, ConfigNode, CoreError, DeviceKind};
use libsynaps_ipc::{new_endpoint_path, EndpointServer, SocketClient};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::Dispatcher;
use crate::devices::{register_platform, register_sensor, virtual_backends, BackendFactory, DeviceFactory};
use crate::error::DaemonError;
use crate::registry::{Registry, SharedAdapter};
use crate::settings::{read_config_file, Settings, WS_CONNECT_WAIT};
use crate::sinks::mqtt::BrokerConfig;
use crate::sinks::ws::EndpointConfig;
use crate::sinks::{MqttSink, SharedSink, Sink, SinkHub, SinkKind, WsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Binding,
    Initializing,
    Running,
    ShuttingDown,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Stopped => "stopped",
            OrchestratorState::Binding => "binding",
            OrchestratorState::Initializing => "initializing",
            OrchestratorState::Running => "running",
            OrchestratorState::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Log a unit that could not be set up; the batch continues
fn unit_failed(unit: &str, path: &str, err: &CoreError) {
    warn!(unit, config = path, reason = err.reason(), error = %err, "Invalid configuration, unit skipped");
}

pub struct Orchestrator {
    settings: Settings,
    registry: Arc<Registry>,
    hub: Arc<SinkHub>,
    factory: DeviceFactory,
    server: Mutex<Option<Box<dyn EndpointServer>>>,
    state: Mutex<OrchestratorState>,
    /// Raised when shutdown begins; abandons device start-up work
    cancel: watch::Sender<bool>,
    /// Raised when shutdown ends; stops sink reconnect loops
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        Self::with_backends(settings, virtual_backends())
    }

    /// Use `backends` to create the pins of relay platforms
    pub fn with_backends(settings: Settings, backends: BackendFactory) -> Self {
        let hub = Arc::new(SinkHub::new());
        let (cancel, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            factory: DeviceFactory::new(hub.clone(), backends).with_cancel(cancel.subscribe()),
            settings,
            registry: Arc::new(Registry::new()),
            hub,
            server: Mutex::new(None),
            state: Mutex::new(OrchestratorState::Stopped),
            cancel,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<SinkHub> {
        &self.hub
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: OrchestratorState) {
        debug!(%state, "Orchestrator state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Path of the bound API endpoint
    pub fn endpoint(&self) -> Option<PathBuf> {
        self.server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.path().to_path_buf())
    }

    /// Probe the runtime directory and bind a new endpoint
    ///
    /// Fails with `AlreadyRunning` when any endpoint answers or times out.
    /// Endpoints refusing the connection are leftovers and get removed.
    pub async fn start_api(&self) -> Result<PathBuf, DaemonError> {
        self.set_state(OrchestratorState::Binding);
        let result = self.bind().await;
        if result.is_err() {
            self.set_state(OrchestratorState::Stopped);
        }
        result
    }

    async fn bind(&self) -> Result<PathBuf, DaemonError> {
        let runtime_dir = self.settings.runtime_dir.clone();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let probe = {
            let dir = runtime_dir.clone();
            let timeout = self.settings.probe_timeout;
            tokio::task::spawn_blocking(move || SocketClient::for_dir(dir).with_timeout(timeout).ping())
                .await
                .map_err(|e| DaemonError::Io(std::io::Error::other(e)))??
        };

        if !probe.active.is_empty() || !probe.timed_out.is_empty() {
            warn!(
                active = ?probe.active,
                timed_out = ?probe.timed_out,
                dir = %runtime_dir.display(),
                "Service is already running"
            );
            return Err(DaemonError::AlreadyRunning);
        }
        for stale in &probe.stale {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => info!(path = %stale.display(), "Removed stale endpoint"),
                Err(e) => warn!(path = %stale.display(), error = %e, "Cannot remove stale endpoint"),
            }
        }

        let path = new_endpoint_path(&runtime_dir);
        let dispatcher = Arc::new(Dispatcher::new(self.registry.clone()));
        let mut server = self.settings.server_shape.server(path.clone(), dispatcher);
        server.start().map_err(DaemonError::ApiNotStarted)?;
        info!(path = %path.display(), shape = %self.settings.server_shape, "API started");

        *self.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(server);
        Ok(path)
    }

    /// Bring up sinks and devices; `false` when a branch failed
    ///
    /// The state ends in `Running` either way, possibly with fewer units
    /// than configured.
    pub async fn initialize(&self) -> bool {
        self.set_state(OrchestratorState::Initializing);
        let (mqtt, ws, sensors, rpio) = tokio::join!(
            self.init_mqtt(),
            self.init_ws(),
            self.init_sensors(),
            self.init_rpio(),
        );

        let mut ok = true;
        for (branch, result) in [("mqtt", mqtt), ("ws", ws), ("sensors", sensors), ("rpio", rpio)] {
            if let Err(e) = result {
                error!(branch, error = %e, "Initialization failed");
                ok = false;
            }
        }

        self.set_state(OrchestratorState::Running);
        info!(
            devices = self.registry.len().await,
            sinks = self.hub.len(),
            "Service running"
        );
        ok
    }

    async fn section(&self, file: &str, key: &str) -> Result<Vec<ConfigNode>, DaemonError> {
        let Some(root) = read_config_file(file, &self.settings.search_path).await? else {
            return Ok(Vec::new());
        };
        let items = root.get_list(key)?;
        if items.is_empty() {
            warn!(file, key, "Nothing configured");
        }
        Ok(items)
    }

    async fn init_mqtt(&self) -> Result<(), DaemonError> {
        let nodes = self.section(paths::MQTT_CONFIG_FILE, "broker").await?;
        let brokers = nodes.iter().map(|node| async move {
            if let Err(e) = self.add_broker(node) {
                unit_failed("mqtt", node.path(), &e);
            }
        });
        join_all(brokers).await;
        Ok(())
    }

    fn add_broker(&self, node: &ConfigNode) -> Result<(), CoreError> {
        let config = BrokerConfig::from_config(node)?;
        if !config.enabled {
            info!(broker = %config.name, "Broker disabled, skipped");
            return Ok(());
        }
        if self.hub.contains(SinkKind::Mqtt, &config.name) {
            return Err(CoreError::AlreadyRegistered(config.name));
        }
        let sink = MqttSink::connect(config, self.shutdown.subscribe());
        self.hub.register(Arc::new(sink))
    }

    async fn init_ws(&self) -> Result<(), DaemonError> {
        let mut pending = Vec::new();
        for node in self.section(paths::WS_CONFIG_FILE, "endpoint").await? {
            let config = match EndpointConfig::from_config(&node) {
                Ok(c) => c,
                Err(e) => {
                    unit_failed("ws", node.path(), &e);
                    continue;
                }
            };
            if self.hub.contains(SinkKind::Ws, &config.name) {
                unit_failed("ws", node.path(), &CoreError::AlreadyRegistered(config.name));
                continue;
            }
            let sink = Arc::new(WsSink::connect(config, self.shutdown.subscribe()));
            match self.hub.register(sink.clone()) {
                Ok(()) => pending.push(sink),
                Err(e) => unit_failed("ws", node.path(), &e),
            }
        }

        let waits = pending.iter().map(|sink| async move {
            if !sink.wait_connected(WS_CONNECT_WAIT).await {
                info!(endpoint = %sink.name(), "WebSocket not connected yet, retrying in background");
            }
        });
        join_all(waits).await;
        Ok(())
    }

    async fn init_sensors(&self) -> Result<(), DaemonError> {
        let nodes = self.section(paths::SENSORS_CONFIG_FILE, "sensor").await?;
        let registrations = nodes.iter().map(|node| async move {
            if let Err(e) = register_sensor(&self.registry, &self.factory, node).await {
                unit_failed("sensor", node.path(), &e);
            }
        });
        join_all(registrations).await;
        Ok(())
    }

    async fn init_rpio(&self) -> Result<(), DaemonError> {
        let nodes = self.section(paths::RPIO_CONFIG_FILE, "platform").await?;
        let registrations = nodes.iter().map(|node| async move {
            if let Err(e) = register_platform(&self.registry, &self.factory, node).await {
                unit_failed("platform", node.path(), &e);
            }
        });
        join_all(registrations).await;
        Ok(())
    }

    /// Stop the API, then close every device and sink concurrently
    ///
    /// Pending start-up work is cancelled and every reading loop is stopped
    /// before its device is closed. All branches run even when some fail;
    /// the failures are reported together afterwards.
    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.set_state(OrchestratorState::ShuttingDown);
        self.cancel.send_replace(true);
        let mut failures = Vec::new();

        let server = self.server.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut server) = server {
            match server.stop() {
                Ok(()) => info!(path = %server.path().display(), "API stopped"),
                Err(e) => failures.push(format!("api: {}", e)),
            }
        }

        let timeout = self.settings.unit_timeout;
        let mut units: Vec<BoxFuture<'static, Result<(), String>>> = Vec::new();
        for kind in DeviceKind::ALL {
            for device in self.registry.drain_kind(kind).await {
                units.push(close_device(device, timeout).boxed());
            }
        }
        for kind in [SinkKind::Mqtt, SinkKind::Ws] {
            for sink in self.hub.drain_kind(kind) {
                units.push(disconnect_sink(sink, timeout).boxed());
            }
        }

        for result in join_all(units).await {
            if let Err(failure) = result {
                warn!(%failure, "Shutdown step failed");
                failures.push(failure);
            }
        }
        // Sinks are closed by now; this only ends their reconnect loops
        self.shutdown.send_replace(true);

        self.set_state(OrchestratorState::Stopped);
        if failures.is_empty() {
            info!("Shutdown completed");
            Ok(())
        } else {
            Err(DaemonError::ErrorDuringShutdown(failures))
        }
    }

    /// Start, run until `signal` resolves, then shut down
    pub async fn run<F>(&self, signal: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        self.start_api().await?;
        tokio::pin!(signal);
        let initialized = tokio::select! {
            initialized = self.initialize() => Some(initialized),
            _ = &mut signal => None,
        };
        let initialized = match initialized {
            Some(initialized) => {
                signal.await;
                info!("Shutdown requested");
                initialized
            }
            None => {
                info!("Shutdown requested during initialization");
                true
            }
        };

        self.shutdown().await?;
        if initialized {
            Ok(())
        } else {
            Err(DaemonError::ServiceNotStarted)
        }
    }
}

async fn close_device(device: SharedAdapter, timeout: Duration) -> Result<(), String> {
    let id = device.id();
    let close = async {
        if let Err(e) = device.stop_reading().await {
            debug!(device = %id, error = %e, "Reading not stopped");
        }
        device.close().await
    };
    match tokio::time::timeout(timeout, close).await {
        Ok(Ok(())) => {
            debug!(device = %id, "Device closed");
            Ok(())
        }
        Ok(Err(e)) => Err(format!("{}: {}", id, e)),
        Err(_) => Err(format!("{}: {}", id, DaemonError::Timeout("close".to_string()))),
    }
}

async fn disconnect_sink(sink: SharedSink, timeout: Duration) -> Result<(), String> {
    let id = format!("{} {}", sink.kind(), sink.name());
    match tokio::time::timeout(timeout, sink.disconnect()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{}: {}", id, e)),
        Err(_) => Err(format!("{}: {}", id, DaemonError::Timeout("disconnect".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::FakeDevice;
    use crate::sinks::testing::RecordingSink;
    use libsynaps_core::DeviceAdapter;

    fn isolated() -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::isolated(dir.path().join("config"), dir.path().join("run"));
        std::fs::create_dir_all(&settings.search_path[0]).unwrap();
        (dir, Orchestrator::new(settings))
    }

    #[tokio::test]
    async fn test_shutdown_attempts_every_close() {
        let (_dir, orchestrator) = isolated();
        let failing = Arc::new(FakeDevice::new(DeviceKind::Sen0395, "hall").failing_close());
        let healthy = Arc::new(FakeDevice::new(DeviceKind::Sen0311, "door"));
        orchestrator.registry().register(failing.clone()).await.unwrap();
        orchestrator.registry().register(healthy.clone()).await.unwrap();

        let result = orchestrator.shutdown().await;

        assert_eq!(failing.closes(), 1);
        assert_eq!(healthy.closes(), 1);
        match result {
            Err(DaemonError::ErrorDuringShutdown(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("sen0395/hall"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(orchestrator.registry().is_empty().await);
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_sinks() {
        let (_dir, orchestrator) = isolated();
        let mut failing = RecordingSink::new(SinkKind::Ws, "ui");
        failing.fail_disconnect = true;
        let failing = Arc::new(failing);
        let healthy = Arc::new(RecordingSink::new(SinkKind::Mqtt, "home"));
        orchestrator.hub().register(failing.clone()).unwrap();
        orchestrator.hub().register(healthy.clone()).unwrap();

        assert!(orchestrator.shutdown().await.is_err());
        assert!(!healthy.is_connected());
        assert!(orchestrator.hub().is_empty());
    }

    #[tokio::test]
    async fn test_degraded_running() {
        let (_dir, orchestrator) = isolated();
        let port = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            orchestrator.settings().search_path[0].join("sensors.toml"),
            format!(
                r#"
                [[sensor]]
                type = "sen0395"
                name = "hall"
                port = "{}"

                [[sensor]]
                type = "sen0395"
                name = "attic"

                [[sensor]]
                type = "sen9999"
                name = "roof"
                port = "/dev/null"
                "#,
                port.path().display()
            ),
        )
        .unwrap();

        assert!(orchestrator.initialize().await);
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        assert_eq!(orchestrator.registry().len().await, 1);
        assert!(orchestrator.registry().contains("hall").await);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_file_fails_branch() {
        let (_dir, orchestrator) = isolated();
        std::fs::write(
            orchestrator.settings().search_path[0].join("rpio.toml"),
            "platform = \"not a list\"\n",
        )
        .unwrap();
        assert!(!orchestrator.initialize().await);
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
    }

    #[tokio::test]
    async fn test_second_instance_refused() {
        let (dir, first) = isolated();
        let path = first.start_api().await.unwrap();
        assert!(path.exists());

        let second = Orchestrator::new(first.settings().clone());
        assert!(matches!(second.start_api().await, Err(DaemonError::AlreadyRunning)));
        assert_eq!(second.state(), OrchestratorState::Stopped);

        first.shutdown().await.unwrap();
        assert!(!path.exists());
        drop(dir);
    }

    #[tokio::test]
    async fn test_stale_endpoint_removed() {
        let (_dir, orchestrator) = isolated();
        let run_dir = orchestrator.settings().runtime_dir.clone();
        std::fs::create_dir_all(&run_dir).unwrap();
        let orphan = run_dir.join("orphan.api");
        drop(std::os::unix::net::UnixDatagram::bind(&orphan).unwrap());

        let path = orchestrator.start_api().await.unwrap();
        assert!(!orphan.exists());
        assert_eq!(orchestrator.endpoint(), Some(path));
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_reading_before_close() {
        let (_dir, orchestrator) = isolated();
        let device = Arc::new(FakeDevice::new(DeviceKind::Sen0395, "hall"));
        device.start_reading().await.unwrap();
        orchestrator.registry().register(device.clone()).await.unwrap();

        orchestrator.shutdown().await.unwrap();
        assert!(!device.status().await.unwrap().reading);
        assert_eq!(device.closes(), 1);
        assert!(*orchestrator.cancel.borrow());
    }

    #[tokio::test]
    async fn test_signal_during_initialization() {
        let (_dir, orchestrator) = isolated();
        std::fs::write(
            orchestrator.settings().search_path[0].join("ws.toml"),
            "[[endpoint]]\nname = \"ui\"\nuri = \"ws://127.0.0.1:1/events\"\n",
        )
        .unwrap();

        let started = std::time::Instant::now();
        orchestrator.run(async {}).await.unwrap();
        assert!(started.elapsed() < WS_CONNECT_WAIT);
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
        assert!(orchestrator.hub().is_empty());
        assert!(orchestrator.endpoint().is_none());
    }

    #[tokio::test]
    async fn test_platforms_initialized_concurrently() {
        let (_dir, orchestrator) = isolated();
        std::fs::write(
            orchestrator.settings().search_path[0].join("rpio.toml"),
            r#"
            [[platform]]
            type = "kincony_server_mini"
            host = "a"
            toggle_cooldown = -0.5

            [[platform]]
            type = "kincony_server_mini"
            host = "b"
            relay = [{ channel = 1, device_id = "lamp" }]

            [[platform]]
            type = "kincony_server_mini"
            host = "c"
            "#,
        )
        .unwrap();

        assert!(orchestrator.initialize().await);
        assert!(!orchestrator.registry().contains("a").await);
        assert!(orchestrator.registry().contains("b").await);
        assert!(orchestrator.registry().contains("c").await);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_signal() {
        let (_dir, orchestrator) = isolated();
        let device = Arc::new(FakeDevice::new(DeviceKind::Rpio, "board"));
        orchestrator.registry().register(device.clone()).await.unwrap();

        orchestrator.run(async {}).await.unwrap();
        assert_eq!(device.closes(), 1);
        assert!(!device.status().await.unwrap().reading);
    }
}
