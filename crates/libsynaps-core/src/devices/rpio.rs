//! GPIO relay/switch platforms
//!
//! A platform groups input switches and output relays that share one pin
//! backend. The only supported board is the Kincony Server-Mini, whose
//! digital inputs and relay channels map to fixed GPIO pins.
//!
//! Switch edges and relay changes are pushed to the item's own observers and
//! forwarded to the platform observers, so a sink binding can be attached at
//! either level.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::adapter::{DeviceAdapter, StatusSnapshot};
use crate::config::ConfigNode;
use crate::error::{AdapterError, CoreError};
use crate::observer::Observers;
use crate::types::command::{CommandOutcome, CommandResult, RelayCommand};
use crate::types::device::DeviceKind;
use crate::types::event::{DeviceEvent, EventKind, RelayState, SwitchState};

/// Configuration `type` tag of the Kincony Server-Mini
pub const KINCONY_SERVER_MINI: &str = "kincony_server_mini";

/// GPIO pins of digital inputs 1..=8
const KSM_INPUT_PINS: [u8; 8] = [18, 23, 24, 25, 12, 16, 20, 21];
/// GPIO pins of relay channels 1..=8
const KSM_RELAY_PINS: [u8; 8] = [5, 22, 17, 4, 6, 13, 19, 26];

pub const DEFAULT_TOGGLE_COOLDOWN: Duration = Duration::from_millis(500);

/// Callback invoked on input edges; `true` means pressed
pub type EdgeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Access to the pins of one GPIO host
pub trait PinBackend: Send + Sync {
    /// Host the pins belong to
    fn host(&self) -> &str;

    /// Claim `pin` as an output; `initial` is the logical value
    fn setup_output(&self, pin: u8, active_high: bool, initial: bool) -> Result<(), AdapterError>;

    fn write(&self, pin: u8, on: bool) -> Result<(), AdapterError>;

    /// Logical value of an output pin
    fn read_output(&self, pin: u8) -> Result<bool, AdapterError>;

    /// Claim `pin` as a pull-up input and call `callback` on every debounced edge
    fn watch_input(
        &self,
        pin: u8,
        bounce: Option<Duration>,
        callback: EdgeCallback,
    ) -> Result<(), AdapterError>;

    /// Give back a single claimed pin
    fn release_pin(&self, pin: u8) -> Result<(), AdapterError>;

    /// Release every claimed pin
    fn close(&self) -> Result<(), AdapterError>;
}

/// Pins claimed while a platform is being built
///
/// Dropping the guard releases them unless [`PinClaims::keep`] was called.
struct PinClaims {
    backend: Arc<dyn PinBackend>,
    pins: Vec<u8>,
}

impl PinClaims {
    fn new(backend: Arc<dyn PinBackend>) -> Self {
        Self {
            backend,
            pins: Vec::new(),
        }
    }

    fn push(&mut self, pin: u8) {
        self.pins.push(pin);
    }

    fn keep(mut self) {
        self.pins.clear();
    }
}

impl Drop for PinClaims {
    fn drop(&mut self) {
        for pin in self.pins.drain(..) {
            if let Err(e) = self.backend.release_pin(pin) {
                warn!(host = %self.backend.host(), pin, error = %e, "Pin not released");
            }
        }
    }
}

struct OutputPin {
    active_high: bool,
    on: bool,
}

struct InputPin {
    bounce: Option<Duration>,
    last_edge: Option<Instant>,
    pressed: bool,
    callback: EdgeCallback,
}

#[derive(Default)]
struct VirtualState {
    outputs: HashMap<u8, OutputPin>,
    inputs: HashMap<u8, InputPin>,
    closed: bool,
}

/// In-memory pin backend
///
/// Used when no GPIO daemon is reachable and by tests; inputs are driven
/// with [`VirtualPins::press`] and [`VirtualPins::release`].
pub struct VirtualPins {
    host: String,
    state: Mutex<VirtualState>,
}

impl VirtualPins {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(VirtualState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn edge(&self, pin: u8, pressed: bool) -> bool {
        let callback = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let Some(input) = state.inputs.get_mut(&pin) else {
                return false;
            };
            if input.pressed == pressed {
                return false;
            }
            let now = Instant::now();
            if let (Some(bounce), Some(last)) = (input.bounce, input.last_edge) {
                if now.duration_since(last) < bounce {
                    return false;
                }
            }
            input.pressed = pressed;
            input.last_edge = Some(now);
            input.callback.clone()
        };
        callback(pressed);
        true
    }

    /// Simulate a press on input `pin`; returns false when the edge was ignored
    pub fn press(&self, pin: u8) -> bool {
        self.edge(pin, true)
    }

    pub fn release(&self, pin: u8) -> bool {
        self.edge(pin, false)
    }

    /// Electrical level of an output pin, taking `active_high` into account
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.lock()
            .outputs
            .get(&pin)
            .map(|o| if o.active_high { o.on } else { !o.on })
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl PinBackend for VirtualPins {
    fn host(&self) -> &str {
        &self.host
    }

    fn setup_output(&self, pin: u8, active_high: bool, initial: bool) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if state.outputs.contains_key(&pin) || state.inputs.contains_key(&pin) {
            return Err(AdapterError::Link(format!("pin {} is already in use", pin)));
        }
        state.outputs.insert(
            pin,
            OutputPin {
                active_high,
                on: initial,
            },
        );
        Ok(())
    }

    fn write(&self, pin: u8, on: bool) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AdapterError::Closed(self.host.clone()));
        }
        let output = state
            .outputs
            .get_mut(&pin)
            .ok_or_else(|| AdapterError::Link(format!("pin {} is not an output", pin)))?;
        output.on = on;
        Ok(())
    }

    fn read_output(&self, pin: u8) -> Result<bool, AdapterError> {
        self.lock()
            .outputs
            .get(&pin)
            .map(|o| o.on)
            .ok_or_else(|| AdapterError::Link(format!("pin {} is not an output", pin)))
    }

    fn watch_input(
        &self,
        pin: u8,
        bounce: Option<Duration>,
        callback: EdgeCallback,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if state.outputs.contains_key(&pin) || state.inputs.contains_key(&pin) {
            return Err(AdapterError::Link(format!("pin {} is already in use", pin)));
        }
        state.inputs.insert(
            pin,
            InputPin {
                bounce,
                last_edge: None,
                pressed: false,
                callback,
            },
        );
        Ok(())
    }

    fn release_pin(&self, pin: u8) -> Result<(), AdapterError> {
        let mut state = self.lock();
        let output = state.outputs.remove(&pin).is_some();
        let input = state.inputs.remove(&pin).is_some();
        if output || input {
            Ok(())
        } else {
            Err(AdapterError::Link(format!("pin {} is not claimed", pin)))
        }
    }

    fn close(&self) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.closed = true;
        state.inputs.clear();
        Ok(())
    }
}

/// One relay channel
pub struct OutputRelay {
    device_id: String,
    pin: u8,
    backend: Arc<dyn PinBackend>,
    observers: Observers,
    cooldown: Duration,
    last_toggle: Mutex<Option<Instant>>,
    config: ConfigNode,
}

impl OutputRelay {
    pub fn new(
        device_id: impl Into<String>,
        pin: u8,
        backend: Arc<dyn PinBackend>,
        active_high: bool,
        initial_state: bool,
    ) -> Result<Self, AdapterError> {
        let device_id = device_id.into();
        backend.setup_output(pin, active_high, initial_state)?;
        Ok(Self {
            config: ConfigNode::new(device_id.clone(), Default::default()),
            device_id,
            pin,
            backend,
            observers: Observers::new(),
            cooldown: DEFAULT_TOGGLE_COOLDOWN,
            last_toggle: Mutex::new(None),
        })
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn with_config(mut self, config: ConfigNode) -> Self {
        self.config = config;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Configuration section the relay was built from
    pub fn config(&self) -> &ConfigNode {
        &self.config
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn state(&self) -> Result<RelayState, AdapterError> {
        Ok(self.backend.read_output(self.pin)?.into())
    }

    /// Drive the relay; observers are notified even when the state is unchanged
    pub fn set_state(&self, state: RelayState) -> Result<(), AdapterError> {
        self.backend.write(self.pin, state == RelayState::On)?;
        self.notify(state);
        Ok(())
    }

    pub fn turn_on(&self) -> Result<(), AdapterError> {
        self.set_state(RelayState::On)
    }

    pub fn turn_off(&self) -> Result<(), AdapterError> {
        self.set_state(RelayState::Off)
    }

    /// Flip the relay unless the previous toggle is inside the cooldown
    ///
    /// Returns the new state, or `None` when the toggle was ignored.
    pub fn toggle(&self) -> Result<Option<RelayState>, AdapterError> {
        {
            let mut last = self.last_toggle.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.cooldown {
                    warn!(relay = %self.device_id, "Relay toggle ignored, in cooldown");
                    return Ok(None);
                }
            }
            *last = Some(now);
        }

        let on = !self.backend.read_output(self.pin)?;
        self.backend.write(self.pin, on)?;
        let state = RelayState::from(on);
        self.notify(state);
        Ok(Some(state))
    }

    fn notify(&self, state: RelayState) {
        self.observers.notify(&DeviceEvent::new(
            self.device_id.clone(),
            EventKind::RelayStateChange { state },
        ));
    }
}

/// One digital input
pub struct InputSwitch {
    device_id: String,
    pin: u8,
    observers: Observers,
    config: ConfigNode,
}

impl InputSwitch {
    pub fn new(
        device_id: impl Into<String>,
        pin: u8,
        backend: &dyn PinBackend,
        bounce: Option<Duration>,
    ) -> Result<Self, AdapterError> {
        let device_id = device_id.into();
        let observers = Observers::new();

        let callback: EdgeCallback = {
            let observers = observers.clone();
            let device_id = device_id.clone();
            Arc::new(move |pressed| {
                let state = if pressed {
                    SwitchState::Pressed
                } else {
                    SwitchState::Released
                };
                observers.notify(&DeviceEvent::new(
                    device_id.clone(),
                    EventKind::SwitchStateChange { state },
                ));
            })
        };
        backend.watch_input(pin, bounce, callback)?;

        Ok(Self {
            config: ConfigNode::new(device_id.clone(), Default::default()),
            device_id,
            pin,
            observers,
        })
    }

    fn with_config(mut self, config: ConfigNode) -> Self {
        self.config = config;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn config(&self) -> &ConfigNode {
        &self.config
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }
}

/// Toggle `relay` whenever `switch` reaches `toggle_on`
pub fn link_switch_to_relay(switch: &InputSwitch, relay: Arc<OutputRelay>, toggle_on: SwitchState) {
    switch.observers().add(move |event: &DeviceEvent| {
        if let EventKind::SwitchStateChange { state } = event.kind {
            if state == toggle_on {
                if let Err(e) = relay.toggle() {
                    warn!(relay = %relay.device_id(), error = %e, "Linked relay toggle failed");
                }
            }
        }
    });
}

fn ksm_pin(pins: &[u8; 8], field: &str, index: i64) -> Result<u8, CoreError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| pins.get(i).copied())
        .ok_or_else(|| {
            CoreError::InvalidConfig(format!("`{}` value `{}` is not between 1-8", field, index))
        })
}

/// A board of switches and relays sharing one pin backend
pub struct RelayPlatform {
    name: String,
    backend: Arc<dyn PinBackend>,
    relays: Vec<Arc<OutputRelay>>,
    switches: Vec<InputSwitch>,
    observers: Observers,
    config: ConfigNode,
}

impl RelayPlatform {
    /// Build a Kincony Server-Mini from its `[[platform]]` section
    ///
    /// Relays are created first so that switch `relay_link` entries can
    /// resolve them by device id.
    pub fn from_config(
        config: &ConfigNode,
        backend: Arc<dyn PinBackend>,
    ) -> Result<Self, CoreError> {
        let platform_type = config.require_str("type")?;
        if !platform_type.eq_ignore_ascii_case(KINCONY_SERVER_MINI) {
            return Err(CoreError::UnknownDeviceType(platform_type));
        }
        let name = match config.get_str("name")? {
            Some(name) if !name.is_empty() => name,
            _ => config.require_str("host")?,
        };
        let cooldown = config
            .get_secs("toggle_cooldown")?
            .unwrap_or(DEFAULT_TOGGLE_COOLDOWN);
        let mut claims = PinClaims::new(backend.clone());

        let observers = Observers::new();
        let forward_to = |items: &Observers| {
            let forward = observers.clone();
            items.add(move |e: &DeviceEvent| forward.notify(e));
        };

        let mut relays = Vec::new();
        for relay_conf in config.get_list("relay")? {
            let channel = relay_conf.require_index("channel")?;
            let pin = ksm_pin(
                &KSM_RELAY_PINS,
                &format!("{}.channel", relay_conf.path()),
                channel,
            )?;
            let device_id = relay_conf.require_str("device_id")?;
            let initial = relay_conf.get_bool("initial_state", false)?;
            let relay = OutputRelay::new(
                device_id,
                pin,
                backend.clone(),
                relay_conf.get_bool("active_high", true)?,
                initial,
            )?
            .with_cooldown(cooldown)
            .with_config(relay_conf);
            claims.push(pin);
            forward_to(relay.observers());
            relays.push(Arc::new(relay));
        }

        let by_id: HashMap<&str, &Arc<OutputRelay>> =
            relays.iter().map(|r| (r.device_id(), r)).collect();
        let global_bounce = match config.get_node("switches")? {
            Some(node) => node.get_secs("bounce_time")?,
            None => None,
        };

        let mut switches = Vec::new();
        for switch_conf in config.get_list("switch")? {
            let input = switch_conf.require_index("digital_input")?;
            let pin = ksm_pin(
                &KSM_INPUT_PINS,
                &format!("{}.digital_input", switch_conf.path()),
                input,
            )?;
            let bounce = match global_bounce {
                Some(bounce) => Some(bounce),
                None => switch_conf.get_secs("bounce_time")?,
            };
            let switch = InputSwitch::new(
                switch_conf.require_str("device_id")?,
                pin,
                backend.as_ref(),
                bounce,
            )?;
            claims.push(pin);
            forward_to(switch.observers());

            for link in switch_conf.get_list("relay_link")? {
                let toggle_on = match link.get_str("toggle_on")? {
                    None => SwitchState::Released,
                    Some(s) => SwitchState::from_name(&s).ok_or_else(|| {
                        CoreError::InvalidConfig(format!(
                            "Invalid state value `{}`, valid: `pressed, released`",
                            s
                        ))
                    })?,
                };
                let target = link.require_str("device")?;
                let relay = by_id.get(target.as_str()).ok_or_else(|| {
                    CoreError::InvalidConfig(format!(
                        "Linked relay devices not found: `{}`",
                        target
                    ))
                })?;
                link_switch_to_relay(&switch, Arc::clone(relay), toggle_on);
            }

            switches.push(switch.with_config(switch_conf));
        }

        claims.keep();
        info!(
            platform = %name,
            host = %backend.host(),
            relays = relays.len(),
            switches = switches.len(),
            "Relay platform created"
        );

        Ok(Self {
            name,
            backend,
            relays,
            switches,
            observers,
            config: config.clone(),
        })
    }

    pub fn host(&self) -> &str {
        self.backend.host()
    }

    pub fn relays(&self) -> &[Arc<OutputRelay>] {
        &self.relays
    }

    pub fn switches(&self) -> &[InputSwitch] {
        &self.switches
    }

    pub fn relay(&self, device_id: &str) -> Option<&Arc<OutputRelay>> {
        self.relays.iter().find(|r| r.device_id() == device_id)
    }

    pub fn config(&self) -> &ConfigNode {
        &self.config
    }

    /// Give back every relay and switch pin without closing the backend
    pub fn release_pins(&self) {
        let pins = self
            .relays
            .iter()
            .map(|r| r.pin())
            .chain(self.switches.iter().map(|s| s.pin()));
        for pin in pins {
            if let Err(e) = self.backend.release_pin(pin) {
                warn!(platform = %self.name, pin, error = %e, "Pin not released");
            }
        }
    }
}

#[async_trait]
impl DeviceAdapter for RelayPlatform {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Rpio
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
        args: &[String],
    ) -> Result<CommandOutcome, AdapterError> {
        let cmd = RelayCommand::from_value(command)
            .ok_or_else(|| AdapterError::UnknownCommand(command.to_string()))?;
        let target = args.first().ok_or_else(|| {
            AdapterError::InvalidArgument("relay device id expected as first argument".to_string())
        })?;
        let Some(relay) = self.relay(target) else {
            return Ok(CommandOutcome::new(command, CommandResult::Missing)
                .with_message(format!("relay {} not found", target)));
        };

        debug!(platform = %self.name, relay = %target, command, "Relay command");
        let outcome = match cmd {
            RelayCommand::On => {
                relay.turn_on()?;
                CommandOutcome::new(command, CommandResult::Done)
            }
            RelayCommand::Off => {
                relay.turn_off()?;
                CommandOutcome::new(command, CommandResult::Done)
            }
            RelayCommand::Toggle => match relay.toggle()? {
                Some(_) => CommandOutcome::new(command, CommandResult::Done),
                None => CommandOutcome::new(command, CommandResult::NotApplicable)
                    .with_message("toggle in cooldown"),
            },
        };
        if outcome.message.is_some() {
            return Ok(outcome);
        }
        Ok(outcome.with_message(relay.state()?.as_str()))
    }

    async fn status(&self) -> Result<StatusSnapshot, AdapterError> {
        let mut relays = serde_json::Map::new();
        for relay in &self.relays {
            relays.insert(
                relay.device_id().to_string(),
                relay.state()?.as_str().into(),
            );
        }
        let switches: Vec<serde_json::Value> = self
            .switches
            .iter()
            .map(|s| s.device_id().into())
            .collect();

        Ok(StatusSnapshot::new(self.id(), true)
            .with("host", self.host())
            .with("relays", relays)
            .with("switches", switches))
    }

    async fn start_reading(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn stop_reading(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        debug!(platform = %self.name, "Closing relay platform");
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLATFORM: &str = r#"
        type = "KINCONY_SERVER_MINI"
        host = "10.0.0.5"

        [[relay]]
        channel = 1
        device_id = "lamp"

        [[relay]]
        channel = "2"
        device_id = "fan"
        initial_state = true
        active_high = false

        [[switch]]
        digital_input = 3
        device_id = "button"
        relay_link = [{ device = "lamp", toggle_on = "pressed" }]
    "#;

    fn platform() -> (RelayPlatform, Arc<VirtualPins>) {
        let pins = Arc::new(VirtualPins::new("10.0.0.5"));
        let config = ConfigNode::parse("platform[0]", PLATFORM).unwrap();
        let platform = RelayPlatform::from_config(&config, pins.clone()).unwrap();
        (platform, pins)
    }

    fn record(observers: &Observers) -> Arc<Mutex<Vec<DeviceEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        observers.add(move |e: &DeviceEvent| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn test_pins_and_initial_state() {
        let (platform, pins) = platform();
        assert_eq!(platform.name(), "10.0.0.5");
        assert_eq!(platform.relay("lamp").unwrap().pin(), 5);
        assert_eq!(platform.relay("fan").unwrap().pin(), 22);
        assert_eq!(platform.switches()[0].pin(), 24);

        assert_eq!(platform.relay("fan").unwrap().state().unwrap(), RelayState::On);
        // active low: logical on drives the line low
        assert_eq!(pins.level(22), Some(false));
    }

    #[test]
    fn test_switch_toggles_linked_relay() {
        let (platform, pins) = platform();
        let events = record(platform.observers());

        assert!(pins.press(24));
        assert_eq!(platform.relay("lamp").unwrap().state().unwrap(), RelayState::On);
        assert!(pins.release(24));
        assert_eq!(platform.relay("lamp").unwrap().state().unwrap(), RelayState::On);

        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::SwitchStateChange { state: SwitchState::Pressed },
                EventKind::RelayStateChange { state: RelayState::On },
                EventKind::SwitchStateChange { state: SwitchState::Released },
            ]
        );
    }

    #[test]
    fn test_toggle_cooldown() {
        let pins: Arc<dyn PinBackend> = Arc::new(VirtualPins::new("local"));
        let relay = OutputRelay::new("lamp", 5, pins, true, false).unwrap();
        let events = record(relay.observers());

        assert_eq!(relay.toggle().unwrap(), Some(RelayState::On));
        assert_eq!(relay.toggle().unwrap(), None);
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(relay.state().unwrap(), RelayState::On);
    }

    #[test]
    fn test_invalid_channel() {
        let pins = Arc::new(VirtualPins::new("local"));
        let config = ConfigNode::parse(
            "platform[0]",
            r#"
            type = "kincony_server_mini"
            host = "local"
            relay = [{ channel = 9, device_id = "x" }]
            "#,
        )
        .unwrap();
        let err = RelayPlatform::from_config(&config, pins).err().unwrap();
        assert!(err.to_string().contains("not between 1-8"));
    }

    #[test]
    fn test_unknown_relay_link() {
        let pins = Arc::new(VirtualPins::new("local"));
        let config = ConfigNode::parse(
            "platform[0]",
            r#"
            type = "kincony_server_mini"
            host = "local"
            switch = [{ digital_input = 1, device_id = "b", relay_link = [{ device = "nope" }] }]
            "#,
        )
        .unwrap();
        assert!(matches!(
            RelayPlatform::from_config(&config, pins),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_failed_build_releases_pins() {
        let pins = Arc::new(VirtualPins::new("local"));
        let broken = ConfigNode::parse(
            "platform[0]",
            r#"
            type = "kincony_server_mini"
            host = "local"
            relay = [{ channel = 1, device_id = "lamp" }, { channel = 9, device_id = "fan" }]
            switch = [{ digital_input = 1, device_id = "b" }]
            "#,
        )
        .unwrap();
        let err = RelayPlatform::from_config(&broken, pins.clone()).err().unwrap();
        assert!(err.to_string().contains("platform[0].relay[1].channel"));
        assert_eq!(pins.level(5), None);

        let broken_switch = ConfigNode::parse(
            "platform[0]",
            r#"
            type = "kincony_server_mini"
            host = "local"
            relay = [{ channel = 1, device_id = "lamp" }]
            switch = [{ digital_input = 1, device_id = "b", relay_link = [{ device = "nope" }] }]
            "#,
        )
        .unwrap();
        assert!(RelayPlatform::from_config(&broken_switch, pins.clone()).is_err());
        assert!(!pins.press(18));

        let fixed = ConfigNode::parse(
            "platform[0]",
            r#"
            type = "kincony_server_mini"
            host = "local"
            relay = [{ channel = 1, device_id = "lamp" }, { channel = 2, device_id = "fan" }]
            switch = [{ digital_input = 1, device_id = "b" }]
            "#,
        )
        .unwrap();
        let platform = RelayPlatform::from_config(&fixed, pins.clone()).unwrap();
        assert_eq!(platform.relays().len(), 2);

        platform.release_pins();
        assert_eq!(pins.level(5), None);
        assert_eq!(pins.level(22), None);
    }

    #[test]
    fn test_negative_cooldown_rejected() {
        let pins = Arc::new(VirtualPins::new("local"));
        let config = ConfigNode::parse(
            "platform[0]",
            "type = \"kincony_server_mini\"\nhost = \"local\"\ntoggle_cooldown = -0.5\n",
        )
        .unwrap();
        assert!(matches!(
            RelayPlatform::from_config(&config, pins.clone()),
            Err(CoreError::InvalidConfig(m)) if m.contains("platform[0].toggle_cooldown")
        ));

        let config = ConfigNode::parse(
            "platform[0]",
            r#"
            type = "kincony_server_mini"
            host = "local"
            switch = [{ digital_input = 1, device_id = "b", bounce_time = nan }]
            "#,
        )
        .unwrap();
        assert!(matches!(
            RelayPlatform::from_config(&config, pins),
            Err(CoreError::InvalidConfig(m)) if m.contains("bounce_time")
        ));
    }

    #[tokio::test]
    async fn test_relay_commands() {
        let (platform, _pins) = platform();
        let args = vec!["lamp".to_string()];

        let outcome = platform.send_command("on", &args).await.unwrap();
        assert_eq!(outcome.result, CommandResult::Done);
        assert_eq!(outcome.message.as_deref(), Some("on"));

        let outcome = platform
            .send_command("off", &["ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.result, CommandResult::Missing);

        assert!(matches!(
            platform.send_command("blink", &args).await,
            Err(AdapterError::UnknownCommand(_))
        ));

        let status = platform.status().await.unwrap();
        assert_eq!(status.details["relays"]["lamp"], "on");
        assert_eq!(status.details["relays"]["fan"], "on");
    }
}
