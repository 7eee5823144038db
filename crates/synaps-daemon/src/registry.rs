//! Device registry
//!
//! Owns every registered adapter. Names are unique across kinds; a second
//! registration under a taken name is rejected, never overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use libsynaps_core::{CoreError, DeviceAdapter, DeviceKind};
use tokio::sync::RwLock;
use tracing::debug;

pub type SharedAdapter = Arc<dyn DeviceAdapter>;

#[derive(Default)]
pub struct Registry {
    devices: RwLock<HashMap<String, SharedAdapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, adapter: SharedAdapter) -> Result<(), CoreError> {
        let name = adapter.name().to_string();
        let mut devices = self.devices.write().await;
        if devices.contains_key(&name) {
            return Err(CoreError::AlreadyRegistered(name));
        }
        debug!(device = %adapter.id(), "Device added to registry");
        devices.insert(name, adapter);
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.devices.read().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<SharedAdapter> {
        self.devices.read().await.get(name).cloned()
    }

    /// All adapters of `kind`, ordered by name
    pub async fn of_kind(&self, kind: DeviceKind) -> Vec<SharedAdapter> {
        let devices = self.devices.read().await;
        let mut found: Vec<SharedAdapter> = devices
            .values()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found
    }

    pub async fn unregister(&self, name: &str) -> Option<SharedAdapter> {
        self.devices.write().await.remove(name)
    }

    /// Remove and return every adapter of `kind`
    pub async fn drain_kind(&self, kind: DeviceKind) -> Vec<SharedAdapter> {
        let mut devices = self.devices.write().await;
        let names: Vec<String> = devices
            .iter()
            .filter(|(_, d)| d.kind() == kind)
            .map(|(name, _)| name.clone())
            .collect();
        names.iter().filter_map(|n| devices.remove(n)).collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory adapter used by daemon tests

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use libsynaps_core::{
        AdapterError, CommandOutcome, CommandResult, DeviceKind, Observers, StatusSnapshot,
    };

    use super::*;

    pub struct FakeDevice {
        pub kind: DeviceKind,
        pub name: String,
        pub fail_close: bool,
        pub closes: AtomicUsize,
        pub reading: AtomicBool,
        pub active: AtomicBool,
        pub panic_on_status: bool,
        observers: Observers,
    }

    impl FakeDevice {
        pub fn new(kind: DeviceKind, name: &str) -> Self {
            Self {
                kind,
                name: name.to_string(),
                fail_close: false,
                closes: AtomicUsize::new(0),
                reading: AtomicBool::new(false),
                active: AtomicBool::new(false),
                panic_on_status: false,
                observers: Observers::new(),
            }
        }

        pub fn failing_close(mut self) -> Self {
            self.fail_close = true;
            self
        }

        pub fn panicking_status(mut self) -> Self {
            self.panic_on_status = true;
            self
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceAdapter for FakeDevice {
        fn kind(&self) -> DeviceKind {
            self.kind
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
            if command == "sensorStart" {
                self.active.store(true, Ordering::SeqCst);
            }
            Ok(CommandOutcome::new(command, CommandResult::Done))
        }

        async fn status(&self) -> Result<StatusSnapshot, AdapterError> {
            if self.panic_on_status {
                panic!("status exploded");
            }
            Ok(StatusSnapshot::new(self.id(), self.reading.load(Ordering::SeqCst)))
        }

        async fn start_reading(&self) -> Result<(), AdapterError> {
            self.reading.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_reading(&self) -> Result<(), AdapterError> {
            self.reading.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_active(&self) -> Result<bool, AdapterError> {
            Ok(self.active.load(Ordering::SeqCst))
        }

        async fn activate(&self) -> Result<CommandOutcome, AdapterError> {
            self.send_command("sensorStart", &[]).await
        }

        async fn close(&self) -> Result<(), AdapterError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(AdapterError::Link("close failed".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
