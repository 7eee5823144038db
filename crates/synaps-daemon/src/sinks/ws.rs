//! WebSocket push sink
//!
//! A reconnect-forever client driven by an explicit state machine:
//! `Disconnected -> Connecting -> Connected -> (closed ? Terminated : Disconnected)`.
//! Incoming messages are only logged.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use libsynaps_core::{ConfigNode, CoreError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Sink, SinkKind};
use crate::error::DaemonError;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Connected,
    Terminated,
}

impl fmt::Display for WsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WsState::Disconnected => "disconnected",
            WsState::Connecting => "connecting",
            WsState::Connected => "connected",
            WsState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Settings of one `[[endpoint]]` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub uri: String,
}

impl EndpointConfig {
    pub fn from_config(config: &ConfigNode) -> Result<Self, CoreError> {
        Ok(Self {
            name: config.require_str("name")?,
            uri: config.require_str("uri")?,
        })
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// Why the connected phase ended
enum Ended {
    Dropped,
    Closed,
}

struct Connection {
    name: String,
    uri: String,
    state: watch::Sender<WsState>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    fn set(&self, state: WsState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        info!(endpoint = %self.name, uri = %self.uri, "WebSocket connecting");
        let uri = self.uri.clone();
        loop {
            self.set(WsState::Connecting);
            let attempt = tokio::select! {
                attempt = connect_async(uri.as_str()) => attempt,
                closed = self.wait_close() => {
                    if closed { break; } else { continue; }
                }
            };

            match attempt {
                Ok((stream, _)) => {
                    info!(endpoint = %self.name, "WebSocket connected");
                    self.set(WsState::Connected);
                    match self.connected(stream).await {
                        Ended::Closed => break,
                        Ended::Dropped => {
                            info!(endpoint = %self.name, "WebSocket disconnected, reconnecting");
                            self.set(WsState::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    debug!(endpoint = %self.name, error = %e, "WebSocket connect failed");
                    self.set(WsState::Disconnected);
                }
            }

            let closed = tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => false,
                closed = self.wait_close() => closed,
            };
            if closed {
                break;
            }
        }
        self.set(WsState::Terminated);
        info!(endpoint = %self.name, "WebSocket terminated");
    }

    /// Resolves when a close was requested (`true`) or a message was dropped
    /// while not connected (`false`)
    async fn wait_close(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => true,
            msg = self.outbound.recv() => match msg {
                None | Some(Outbound::Close) => true,
                Some(Outbound::Text(text)) => {
                    warn!(endpoint = %self.name, message = %text, "Message not sent, disconnected");
                    false
                }
            }
        }
    }

    async fn connected<S>(&mut self, stream: S) -> Ended
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                msg = self.outbound.recv() => match msg {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(endpoint = %self.name, error = %e, "WebSocket send failed");
                            return Ended::Dropped;
                        }
                    }
                    None | Some(Outbound::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ended::Closed;
                    }
                },
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ended::Closed;
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None => return Ended::Dropped,
                    Some(Ok(message)) => {
                        debug!(endpoint = %self.name, %message, "WebSocket message received");
                    }
                    Some(Err(e)) => {
                        debug!(endpoint = %self.name, error = %e, "WebSocket read failed");
                        return Ended::Dropped;
                    }
                }
            }
        }
    }
}

pub struct WsSink {
    config: EndpointConfig,
    state: watch::Receiver<WsState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsSink {
    /// Spawn the connection task; it keeps reconnecting until closed
    pub fn connect(config: EndpointConfig, shutdown: watch::Receiver<bool>) -> Self {
        let (state_tx, state_rx) = watch::channel(WsState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            name: config.name.clone(),
            uri: config.uri.clone(),
            state: state_tx,
            outbound: outbound_rx,
            shutdown,
        };
        let task = tokio::spawn(connection.run());

        Self {
            config,
            state: state_rx,
            outbound: outbound_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> WsState {
        *self.state.borrow()
    }

    /// Wait until connected; false on timeout or termination
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let connected = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, WsState::Connected | WsState::Terminated)),
        )
        .await;
        matches!(connected, Ok(Ok(s)) if *s == WsState::Connected)
    }
}

#[async_trait]
impl Sink for WsSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Ws
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_connected(&self) -> bool {
        self.state() == WsState::Connected
    }

    fn publish(&self, _target: &str, payload: &str) -> Result<(), DaemonError> {
        if !self.is_connected() {
            return Err(DaemonError::NotConnected(self.config.name.clone()));
        }
        self.outbound
            .send(Outbound::Text(payload.to_string()))
            .map_err(|_| DaemonError::NotConnected(self.config.name.clone()))
    }

    async fn disconnect(&self) -> Result<(), DaemonError> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else {
            return Ok(());
        };
        info!(endpoint = %self.config.name, "Closing WebSocket connection");
        let _ = self.outbound.send(Outbound::Close);
        task.await
            .map_err(|e| DaemonError::Sink(format!("connection task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_requires_uri() {
        let node = ConfigNode::parse("", "[[endpoint]]\nname = \"ui\"\n").unwrap();
        let endpoint = &node.get_list("endpoint").unwrap()[0];
        assert!(matches!(
            EndpointConfig::from_config(endpoint),
            Err(CoreError::MissingField { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let (_tx, rx) = watch::channel(false);
        let sink = WsSink::connect(
            EndpointConfig {
                name: "ui".to_string(),
                uri: "ws://127.0.0.1:1/events".to_string(),
            },
            rx,
        );
        assert!(!sink.wait_connected(Duration::from_millis(200)).await);
        assert!(sink.publish("", "{}").is_err());
        sink.disconnect().await.unwrap();
        assert_eq!(sink.state(), WsState::Terminated);
    }

    #[tokio::test]
    async fn test_delivers_to_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                other => panic!("unexpected: {:?}", other),
            }
        });

        let (_tx, rx) = watch::channel(false);
        let sink = WsSink::connect(
            EndpointConfig {
                name: "ui".to_string(),
                uri: format!("ws://{}", addr),
            },
            rx,
        );
        assert!(sink.wait_connected(Duration::from_secs(2)).await);
        sink.publish("", r#"{"event":"presence_change"}"#).unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, r#"{"event":"presence_change"}"#);
        sink.disconnect().await.unwrap();
    }
}
