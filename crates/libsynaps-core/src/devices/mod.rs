//! Built-in device adapters

pub mod rpio;
pub mod sen0311;
pub mod sen0395;

use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::observer::Observers;
use crate::types::event::{DeviceEvent, EventKind};

pub use rpio::{InputSwitch, OutputRelay, PinBackend, RelayPlatform, VirtualPins};
pub use sen0311::DistanceSensor;
pub use sen0395::PresenceSensor;

/// Last known presence of a sensor; notifies observers only on flips
#[derive(Debug)]
pub(crate) struct PresenceTracker {
    device_id: String,
    last: Mutex<Option<bool>>,
    observers: Observers,
}

impl PresenceTracker {
    pub(crate) fn new(device_id: String, observers: Observers) -> Self {
        Self {
            device_id,
            last: Mutex::new(None),
            observers,
        }
    }

    pub(crate) fn current(&self) -> Option<bool> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a reading; returns true when it changed the presence state
    pub(crate) fn update(&self, presence: bool) -> bool {
        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if *last == Some(presence) {
                return false;
            }
            *last = Some(presence);
        }
        self.observers.notify(&DeviceEvent::new(
            self.device_id.clone(),
            EventKind::PresenceChange { presence },
        ));
        true
    }
}

/// Handle to a background reading loop
pub(crate) struct ReadingTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReadingTask {
    pub(crate) fn new(stop_tx: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { stop_tx, handle }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait until it has exited
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Slot holding the optional reading loop of an adapter
#[derive(Default)]
pub(crate) struct ReadingSlot {
    task: Mutex<Option<ReadingTask>>,
}

impl ReadingSlot {
    pub(crate) fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Store a freshly spawned loop unless one is already running
    ///
    /// `spawn` is only called when the slot is free.
    pub(crate) fn start_with<F>(&self, spawn: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> JoinHandle<()>,
    {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *task = Some(ReadingTask::new(stop_tx, spawn(stop_rx)));
    }

    pub(crate) async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}
