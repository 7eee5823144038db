//! Ordered observer lists
//!
//! Devices notify their observers synchronously, in registration order, on
//! every computed state change. Observers must not block; sink delivery is
//! expected to hand the event off and return.

use std::sync::{Arc, RwLock};

use crate::types::event::DeviceEvent;

pub type Observer = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Shared, append-only list of observer callbacks
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<Observer>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, observer: F)
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer with `event`
    ///
    /// The list is snapshotted first so an observer may trigger further
    /// notifications (switch → relay) without holding the lock.
    pub fn notify(&self, event: &DeviceEvent) {
        let observers: Vec<Observer> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer(event);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event::EventKind;
    use std::sync::Mutex;

    #[test]
    fn test_notify_in_order() {
        let observers = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            observers.add(move |e: &DeviceEvent| {
                seen.lock().unwrap().push(format!("{}:{}", tag, e.device_id));
            });
        }

        observers.notify(&DeviceEvent::new(
            "hall",
            EventKind::PresenceChange { presence: true },
        ));

        assert_eq!(observers.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first:hall", "second:hall"]);
    }

    #[test]
    fn test_observer_may_register_during_notify() {
        let observers = Observers::new();
        let inner = observers.clone();
        observers.add(move |_e: &DeviceEvent| inner.add(|_e: &DeviceEvent| {}));

        observers.notify(&DeviceEvent::new(
            "hall",
            EventKind::PresenceChange { presence: false },
        ));
        assert_eq!(observers.len(), 2);
    }
}
