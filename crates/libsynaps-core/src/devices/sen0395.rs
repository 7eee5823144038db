//! DFRobot SEN0395 mmWave presence radar
//!
//! The radar speaks a line protocol: a command line is echoed back, followed
//! by optional response lines and a final `Done` or `Error`. While scanning it
//! also emits `$JYBSS,<0|1>, , , *` presence frames roughly once a second.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::adapter::{ConfigSnapshot, DeviceAdapter, StatusSnapshot};
use crate::devices::{PresenceTracker, ReadingSlot};
use crate::error::AdapterError;
use crate::link::SensorLink;
use crate::observer::Observers;
use crate::types::command::{CommandOutcome, CommandResult, ConfigChainOutcome, Sen0395Command};
use crate::types::device::{DeviceId, DeviceKind};

const PRESENCE_FRAME_PREFIX: &str = "$JYBSS,";
const PROMPT: &str = "leapMMW:/>";

/// Timing knobs of the radar protocol
#[derive(Debug, Clone, Copy)]
pub struct Sen0395Timing {
    /// Total time to wait for a command to complete
    pub command_timeout: Duration,
    /// Single read attempt inside the reading loop
    pub read_poll: Duration,
    /// A presence frame younger than this means the radar is scanning
    pub frame_freshness: Duration,
    /// How long to listen for a frame when reading is off
    pub presence_probe: Duration,
}

impl Default for Sen0395Timing {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            read_poll: Duration::from_millis(200),
            frame_freshness: Duration::from_secs(2),
            presence_probe: Duration::from_millis(1500),
        }
    }
}

/// Parse a presence frame; `None` for any other line
pub fn parse_presence_frame(line: &str) -> Option<bool> {
    let rest = line.trim().strip_prefix(PRESENCE_FRAME_PREFIX)?;
    match rest.split(',').next()?.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

struct PresenceState {
    tracker: PresenceTracker,
    last_frame: Mutex<Option<Instant>>,
}

impl PresenceState {
    fn on_frame(&self, presence: bool) {
        *self.last_frame.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.tracker.update(presence);
    }

    fn frame_age(&self) -> Option<Duration> {
        self.last_frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed())
    }
}

pub struct PresenceSensor {
    name: String,
    link: Arc<dyn SensorLink>,
    /// Held for a whole command exchange so replies are not interleaved
    exchange: Arc<AsyncMutex<()>>,
    observers: Observers,
    state: Arc<PresenceState>,
    reading: ReadingSlot,
    timing: Sen0395Timing,
}

impl PresenceSensor {
    pub fn new(name: impl Into<String>, link: Arc<dyn SensorLink>) -> Self {
        Self::with_timing(name, link, Sen0395Timing::default())
    }

    pub fn with_timing(
        name: impl Into<String>,
        link: Arc<dyn SensorLink>,
        timing: Sen0395Timing,
    ) -> Self {
        let name = name.into();
        let observers = Observers::new();
        let device_id = DeviceId::new(DeviceKind::Sen0395, name.clone()).to_string();
        Self {
            name,
            link,
            exchange: Arc::new(AsyncMutex::new(())),
            state: Arc::new(PresenceState {
                tracker: PresenceTracker::new(device_id, observers.clone()),
                last_frame: Mutex::new(None),
            }),
            observers,
            reading: ReadingSlot::default(),
            timing,
        }
    }

    /// Write one command and collect the radar's answer
    async fn exchange(&self, command: &str, args: &[String]) -> Result<CommandOutcome, AdapterError> {
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }

        let _guard = self.exchange.lock().await;
        self.link.write_all(format!("{}\r\n", line).as_bytes()).await?;

        let deadline = Instant::now() + self.timing.command_timeout;
        let mut echo = None;
        let mut result = None;
        let mut messages = Vec::new();

        while result.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(raw) = self.link.read_line(remaining).await? else {
                break;
            };
            if let Some(presence) = parse_presence_frame(&raw) {
                self.state.on_frame(presence);
                continue;
            }

            let text = raw.trim().trim_start_matches(PROMPT).trim();
            if text.is_empty() {
                continue;
            }
            if echo.is_none() && text.starts_with(command) {
                echo = Some(text.to_string());
            } else if text == "Done" {
                result = Some(CommandResult::Done);
            } else if text == "Error" {
                result = Some(CommandResult::Error);
            } else if text.contains("already") {
                result = Some(CommandResult::NotApplicable);
                messages.push(text.to_string());
            } else {
                messages.push(text.to_string());
            }
        }

        let result = result.unwrap_or(if echo.is_none() && messages.is_empty() {
            CommandResult::Missing
        } else {
            CommandResult::Unknown
        });

        debug!(sensor = %self.name, command = %line, ?result, "Command exchanged");

        let mut outcome = CommandOutcome::new(command, result);
        outcome.command_echo = echo;
        if !messages.is_empty() {
            outcome.message = Some(messages.join("; "));
        }
        Ok(outcome)
    }

    /// Listen for a presence frame while the reading loop is off
    async fn probe_presence(&self) -> Result<Option<bool>, AdapterError> {
        let _guard = self.exchange.lock().await;
        let deadline = Instant::now() + self.timing.presence_probe;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.link.read_line(remaining).await? {
                Some(line) => {
                    if let Some(presence) = parse_presence_frame(&line) {
                        self.state.on_frame(presence);
                        return Ok(Some(presence));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl DeviceAdapter for PresenceSensor {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Sen0395
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
        let cmd = Sen0395Command::from_value(command)
            .ok_or_else(|| AdapterError::UnknownCommand(command.to_string()))?;
        self.exchange(cmd.value(), args).await
    }

    async fn configure(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ConfigChainOutcome, AdapterError> {
        let cmd = Sen0395Command::from_value(command)
            .ok_or_else(|| AdapterError::UnknownCommand(command.to_string()))?;
        if !cmd.is_config() {
            return Err(AdapterError::NotConfigCommand(command.to_string()));
        }

        let scanning = self.is_active().await?;
        let mut chain = ConfigChainOutcome::default();

        if scanning {
            let pause = self.exchange(Sen0395Command::SensorStop.value(), &[]).await?;
            let paused = pause.is_success();
            chain.pause = Some(pause);
            if !paused {
                return Ok(chain);
            }
        }

        let configure = self.exchange(cmd.value(), args).await?;
        let configured = configure.is_success();
        chain.configure = Some(configure);

        if configured {
            let save_args: Vec<String> = Sen0395Command::SAVE_CONFIG_ARGS
                .iter()
                .map(|a| a.to_string())
                .collect();
            chain.save = Some(
                self.exchange(Sen0395Command::SaveConfig.value(), &save_args)
                    .await?,
            );
        }

        if scanning {
            chain.resume = Some(self.exchange(Sen0395Command::SensorStart.value(), &[]).await?);
        }

        Ok(chain)
    }

    async fn status(&self) -> Result<StatusSnapshot, AdapterError> {
        let scanning = self.is_active().await?;
        Ok(StatusSnapshot::new(self.id(), self.reading.is_running())
            .with("port", self.link.port())
            .with("scanning", scanning)
            .with("presence", self.state.tracker.current()))
    }

    async fn config(&self) -> Result<ConfigSnapshot, AdapterError> {
        let mut snapshot = ConfigSnapshot::new(self.id());
        for (key, cmd) in [
            ("range", Sen0395Command::GetRange),
            ("latency", Sen0395Command::GetLatency),
            ("sensitivity", Sen0395Command::GetSensitivity),
        ] {
            let outcome = self.exchange(cmd.value(), &[]).await?;
            snapshot = snapshot.with(key, outcome.message);
        }
        Ok(snapshot)
    }

    async fn start_reading(&self) -> Result<(), AdapterError> {
        let link = self.link.clone();
        let exchange = self.exchange.clone();
        let state = self.state.clone();
        let name = self.name.clone();
        let poll = self.timing.read_poll;

        self.reading.start_with(move |mut stop_rx| {
            tokio::spawn(async move {
                debug!(sensor = %name, "Reading started");
                loop {
                    let read = async {
                        let _guard = exchange.lock().await;
                        link.read_line(poll).await
                    };
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        line = read => match line {
                            Ok(Some(line)) => {
                                if let Some(presence) = parse_presence_frame(&line) {
                                    state.on_frame(presence);
                                }
                            }
                            Ok(None) => {}
                            Err(AdapterError::Closed(_)) => break,
                            Err(e) => {
                                warn!(sensor = %name, error = %e, "Read failed");
                                tokio::time::sleep(poll).await;
                            }
                        }
                    }
                    // Let command exchanges grab the link between reads
                    tokio::task::yield_now().await;
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
        let _guard = self.exchange.lock().await;
        self.link.clear_buffer().await
    }

    async fn is_active(&self) -> Result<bool, AdapterError> {
        if self.reading.is_running() {
            let fresh = self
                .state
                .frame_age()
                .map(|age| age < self.timing.frame_freshness)
                .unwrap_or(false);
            if fresh {
                return Ok(true);
            }
        }
        Ok(self.probe_presence().await?.is_some())
    }

    async fn activate(&self) -> Result<CommandOutcome, AdapterError> {
        self.exchange(Sen0395Command::SensorStart.value(), &[]).await
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

    fn fast() -> Sen0395Timing {
        Sen0395Timing {
            command_timeout: Duration::from_millis(200),
            read_poll: Duration::from_millis(10),
            frame_freshness: Duration::from_millis(500),
            presence_probe: Duration::from_millis(50),
        }
    }

    fn sensor(link: &Arc<ScriptedLink>) -> PresenceSensor {
        PresenceSensor::with_timing("hall", link.clone(), fast())
    }

    #[test]
    fn test_parse_presence_frame() {
        assert_eq!(parse_presence_frame("$JYBSS,1, , , *"), Some(true));
        assert_eq!(parse_presence_frame("$JYBSS,0, , , *"), Some(false));
        assert_eq!(parse_presence_frame("Done"), None);
        assert_eq!(parse_presence_frame("$JYBSS,x, , , *"), None);
    }

    #[tokio::test]
    async fn test_send_command_done() {
        let link = Arc::new(ScriptedLink::new());
        link.reply("sensorStart", &["leapMMW:/>sensorStart", "Done"]);

        let outcome = sensor(&link).send_command("sensorStart", &[]).await.unwrap();
        assert_eq!(outcome.result, CommandResult::Done);
        assert_eq!(outcome.command_echo.as_deref(), Some("sensorStart"));
        assert_eq!(*link.written.lock().unwrap(), vec!["sensorStart"]);
    }

    #[tokio::test]
    async fn test_send_command_missing_reply() {
        let link = Arc::new(ScriptedLink::new());
        let outcome = sensor(&link).send_command("sensorStop", &[]).await.unwrap();
        assert_eq!(outcome.result, CommandResult::Missing);
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let link = Arc::new(ScriptedLink::new());
        let err = sensor(&link).send_command("selfDestruct", &[]).await.unwrap_err();
        assert!(matches!(err, AdapterError::UnknownCommand(_)));
        assert!(link.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_chain_while_scanning() {
        let link = Arc::new(ScriptedLink::new());
        link.push_line("$JYBSS,0, , , *");
        link.reply("sensorStop", &["sensorStop", "Done"]);
        link.reply("outputLatency", &["outputLatency -1 10 20", "Done"]);
        link.reply("saveCfg", &["saveCfg", "Done"]);
        link.reply("sensorStart", &["sensorStart", "Done"]);

        let args = vec!["-1".to_string(), "10".to_string(), "20".to_string()];
        let chain = sensor(&link).configure("outputLatency", &args).await.unwrap();

        assert!(chain.is_success());
        assert!(chain.pause.is_some());
        assert!(chain.resume.is_some());
        let written = link.written.lock().unwrap().clone();
        assert_eq!(written[0], "sensorStop");
        assert_eq!(written[1], "outputLatency -1 10 20");
        assert!(written[2].starts_with("saveCfg 0x45670123"));
        assert_eq!(written[3], "sensorStart");
    }

    #[tokio::test]
    async fn test_config_chain_rejects_non_config_command() {
        let link = Arc::new(ScriptedLink::new());
        let err = sensor(&link).configure("sensorStart", &[]).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConfigCommand(_)));
    }

    #[tokio::test]
    async fn test_reading_emits_presence_flips_only() {
        let link = Arc::new(ScriptedLink::new());
        let sensor = sensor(&link);
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            sensor.observers().add(move |e: &DeviceEvent| {
                events.lock().unwrap().push(e.kind.clone());
            });
        }

        for line in ["$JYBSS,1, , , *", "$JYBSS,1, , , *", "$JYBSS,0, , , *"] {
            link.push_line(line);
        }
        sensor.start_reading().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sensor.close().await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                EventKind::PresenceChange { presence: true },
                EventKind::PresenceChange { presence: false },
            ]
        );
        assert!(link.is_closed());
    }
}
