//! Clients for datagram endpoints
//!
//! [`SocketClient`] sends one request to every discovered endpoint and
//! collects the replies. It is synchronous; async callers run it on a
//! blocking thread. [`ApiClient`] layers JSON-RPC on top and expects exactly
//! one daemon to answer.

use std::collections::HashSet;
use std::fmt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use libsynaps_core::{DeviceKind, RelayCommand};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::discovery::{endpoint_id, list_endpoints, unique_timestamp_hex};
use crate::error::IpcError;
use crate::messages::{RequestEnvelope, ResponseEnvelope};
use crate::{DEFAULT_TIMEOUT_MS, PING, PONG, RECV_BUFFER_LENGTH};

/// Why a candidate produced no reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    Timeout,
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::Timeout => f.write_str("timed out waiting for response"),
        }
    }
}

/// Reply (or its absence) from one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// Endpoint id (socket file stem)
    pub id: String,
    pub response: Option<String>,
    pub error: Option<TransportFault>,
}

/// Liveness of every endpoint found in the runtime directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingResult {
    /// Ids of endpoints that answered `pong`
    pub active: Vec<String>,
    /// Ids of endpoints that accepted the ping but did not answer in time
    pub timed_out: Vec<String>,
    /// Socket files nobody is listening on
    pub stale: Vec<PathBuf>,
}

impl PingResult {
    /// Whether some endpoint may still be served by a running process
    pub fn is_alive(&self) -> bool {
        !self.active.is_empty() || !self.timed_out.is_empty()
    }
}

/// Outcome of one request sent to every candidate
struct Exchange {
    responses: Vec<ServerResponse>,
    /// Candidates of this exchange nobody listens on
    stale: Vec<PathBuf>,
}

type EndpointProvider = Box<dyn Fn() -> Result<Vec<PathBuf>, IpcError> + Send + Sync>;

/// Local socket of the client, removed on drop when it was bound
struct ClientSocket {
    socket: UnixDatagram,
    path: Option<PathBuf>,
}

impl ClientSocket {
    fn bound() -> Result<Self, IpcError> {
        let path = std::env::temp_dir().join(format!("synaps-client-{}.sock", unique_timestamp_hex()));
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self {
            socket,
            path: Some(path),
        })
    }

    fn unbound() -> Result<Self, IpcError> {
        Ok(Self {
            socket: UnixDatagram::unbound()?,
            path: None,
        })
    }

    /// Wait for the reply of `endpoint`, ignoring late replies from others
    fn receive_from(
        &self,
        endpoint: &Path,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Result<Option<String>, IpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;
            match self.socket.recv_from(buf) {
                Ok((len, addr)) => {
                    let sender = addr.as_pathname().and_then(Path::file_name);
                    if sender == endpoint.file_name() {
                        return Ok(Some(String::from_utf8_lossy(&buf[..len]).into_owned()));
                    }
                    debug!(?sender, "Late reply ignored");
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Multi-endpoint datagram client
pub struct SocketClient {
    provider: EndpointProvider,
    bidirectional: bool,
    timeout: Duration,
    timed_out: HashSet<String>,
    stale: HashSet<PathBuf>,
}

impl SocketClient {
    /// Client over the endpoints returned by `provider` on every exchange
    pub fn new<F>(provider: F) -> Self
    where
        F: Fn() -> Result<Vec<PathBuf>, IpcError> + Send + Sync + 'static,
    {
        Self {
            provider: Box::new(provider),
            bidirectional: true,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            timed_out: HashSet::new(),
            stale: HashSet::new(),
        }
    }

    /// Client over every `*.api` endpoint in `dir`
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(move || list_endpoints(&dir))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send without waiting for replies
    pub fn fire_and_forget(mut self) -> Self {
        self.bidirectional = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ids of endpoints that timed out during this session
    pub fn timed_out(&self) -> &HashSet<String> {
        &self.timed_out
    }

    /// Endpoint files found dead during this session; later calls skip them
    pub fn stale(&self) -> &HashSet<PathBuf> {
        &self.stale
    }

    /// Send `request` to every live candidate and collect the replies
    ///
    /// `include` limits the candidates to the given endpoint ids. Timeouts
    /// and dead endpoints never abort the exchange; an oversized request does.
    pub fn communicate(
        &mut self,
        request: &str,
        include: Option<&[String]>,
    ) -> Result<Vec<ServerResponse>, IpcError> {
        self.exchange(request, include).map(|e| e.responses)
    }

    fn exchange(&mut self, request: &str, include: Option<&[String]>) -> Result<Exchange, IpcError> {
        let socket = if self.bidirectional {
            ClientSocket::bound()?
        } else {
            ClientSocket::unbound()?
        };
        let mut buf = vec![0u8; RECV_BUFFER_LENGTH];
        let mut responses = Vec::new();
        let mut stale = Vec::new();

        for endpoint in (self.provider)()? {
            let id = endpoint_id(&endpoint);
            if let Some(include) = include {
                if !include.contains(&id) {
                    continue;
                }
            }
            if self.stale.contains(&endpoint) {
                stale.push(endpoint);
                continue;
            }

            if let Err(e) = socket.socket.send_to(request.as_bytes(), &endpoint) {
                match e.raw_os_error() {
                    Some(libc::ECONNREFUSED) => {
                        debug!(endpoint = %endpoint.display(), "Stale endpoint");
                        self.stale.insert(endpoint.clone());
                        stale.push(endpoint);
                        continue;
                    }
                    Some(libc::ENOENT) | Some(libc::EPIPE) => continue,
                    Some(libc::EMSGSIZE) => return Err(IpcError::PayloadTooLarge(request.len())),
                    _ => return Err(e.into()),
                }
            }

            if !self.bidirectional {
                responses.push(ServerResponse {
                    id,
                    response: None,
                    error: None,
                });
                continue;
            }

            match socket.receive_from(&endpoint, self.timeout, &mut buf)? {
                Some(response) => responses.push(ServerResponse {
                    id,
                    response: Some(response),
                    error: None,
                }),
                None => {
                    warn!(endpoint = %id, timeout_ms = self.timeout.as_millis() as u64, "Endpoint timed out");
                    self.timed_out.insert(id.clone());
                    responses.push(ServerResponse {
                        id,
                        response: None,
                        error: Some(TransportFault::Timeout),
                    });
                }
            }
        }

        Ok(Exchange { responses, stale })
    }

    /// Probe every endpoint with `ping`
    ///
    /// The result covers the endpoints listed during this call only.
    pub fn ping(&mut self) -> Result<PingResult, IpcError> {
        let exchange = self.exchange(PING, None)?;
        let mut result = PingResult {
            stale: exchange.stale,
            ..PingResult::default()
        };
        for response in exchange.responses {
            match (response.response.as_deref(), response.error) {
                (Some(PONG), _) => result.active.push(response.id),
                (_, Some(_)) => result.timed_out.push(response.id),
                (other, None) => {
                    warn!(endpoint = %response.id, reply = ?other, "Unexpected ping reply");
                    result.active.push(response.id);
                }
            }
        }
        result.stale.sort();
        Ok(result)
    }
}

/// JSON-RPC client of the daemon API
pub struct ApiClient {
    client: SocketClient,
    next_id: u64,
}

impl ApiClient {
    /// Client of the daemon serving from `runtime_dir`
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self::with_client(SocketClient::for_dir(runtime_dir))
    }

    pub fn with_client(client: SocketClient) -> Self {
        Self { client, next_id: 1 }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.with_timeout(timeout);
        self
    }

    /// Send one request; exactly one endpoint must answer
    pub fn send_request(&mut self, method: &str, params: Value) -> Result<Value, IpcError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = RequestEnvelope::new(method, params, id).to_json()?;

        let mut responses = self.client.communicate(&request, None)?;
        let response = match responses.len() {
            0 => return Err(IpcError::NoService),
            1 => responses.remove(0),
            n => return Err(IpcError::MultipleResponses(n)),
        };

        if let Some(fault) = response.error {
            return Err(IpcError::ServiceError(fault.to_string()));
        }
        let text = response
            .response
            .ok_or_else(|| IpcError::ServiceError("empty response".to_string()))?;
        let envelope: ResponseEnvelope = serde_json::from_str(&text)?;
        envelope.into_result()
    }

    pub fn send_command(
        &mut self,
        kind: DeviceKind,
        name: Option<&str>,
        command: &str,
        args: &[String],
    ) -> Result<Value, IpcError> {
        self.send_request(
            &format!("{}.command", kind),
            json!({ "name": name, "command": command, "args": args }),
        )
    }

    pub fn configure(
        &mut self,
        kind: DeviceKind,
        name: Option<&str>,
        command: &str,
        args: &[String],
    ) -> Result<Value, IpcError> {
        self.send_request(
            &format!("{}.configure", kind),
            json!({ "name": name, "command": command, "args": args }),
        )
    }

    pub fn status(&mut self, kind: DeviceKind, name: Option<&str>) -> Result<Value, IpcError> {
        self.send_request(&format!("{}.status", kind), json!({ "name": name }))
    }

    pub fn config(&mut self, kind: DeviceKind, name: Option<&str>) -> Result<Value, IpcError> {
        self.send_request(&format!("{}.config", kind), json!({ "name": name }))
    }

    pub fn set_reading(
        &mut self,
        kind: DeviceKind,
        name: Option<&str>,
        enabled: bool,
    ) -> Result<Value, IpcError> {
        self.send_request(
            &format!("{}.reading", kind),
            json!({ "name": name, "enabled": enabled }),
        )
    }

    /// Switch relay `relay` on the platform `platform` (all platforms when `None`)
    pub fn relay_command(
        &mut self,
        platform: Option<&str>,
        command: RelayCommand,
        relay: &str,
    ) -> Result<Value, IpcError> {
        self.send_command(DeviceKind::Rpio, platform, command.value(), &[relay.to_string()])
    }
}
