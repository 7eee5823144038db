//! Datagram socket servers
//!
//! Two shapes share one wire contract:
//! - [`SocketServer`] receives on a tokio task and handles every datagram
//!   on its own task, so replies may complete out of order.
//! - [`BlockingSocketServer`] receives on a dedicated thread and drives the
//!   handler futures one at a time through a runtime handle.
//!
//! An empty datagram stops the receive loop. The literal `ping` is answered
//! with `pong` without reaching the handler.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;

use async_trait::async_trait;
use tokio::net::UnixDatagram;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::IpcError;
use crate::{PING, PONG, RECV_BUFFER_LENGTH};

/// Request handler behind an endpoint
///
/// Returning `None` sends no reply.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: String) -> Option<String>;
}

/// Common surface of both server shapes
pub trait EndpointServer: Send {
    fn path(&self) -> &Path;

    /// Bind and start serving; fails with `StoppedAlready` after `stop`
    fn start(&mut self) -> Result<(), IpcError>;

    /// Stop serving and remove the endpoint file
    fn stop(&mut self) -> Result<(), IpcError>;
}

/// Which server shape the daemon runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerShape {
    #[default]
    Async,
    Blocking,
}

impl ServerShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerShape::Async => "async",
            ServerShape::Blocking => "blocking",
        }
    }

    /// Build a server of this shape
    pub fn server(&self, path: PathBuf, handler: Arc<dyn Handler>) -> Box<dyn EndpointServer> {
        match self {
            ServerShape::Async => Box::new(SocketServer::new(path, handler)),
            ServerShape::Blocking => Box::new(BlockingSocketServer::new(path, handler)),
        }
    }
}

impl fmt::Display for ServerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "async" => Ok(ServerShape::Async),
            "blocking" => Ok(ServerShape::Blocking),
            other => Err(format!("unknown server shape: {}", other)),
        }
    }
}

enum Lifecycle<T> {
    Created,
    Running(T),
    Stopped,
}

fn bind_std(path: &Path) -> Result<StdUnixDatagram, IpcError> {
    let socket = StdUnixDatagram::bind(path).map_err(|source| IpcError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).map_err(
        |source| IpcError::Bind {
            path: path.to_path_buf(),
            source,
        },
    )?;
    Ok(socket)
}

/// Send the empty datagram that ends a receive loop, then remove the file
fn poison_and_remove(path: &Path) -> Result<(), IpcError> {
    let pill = StdUnixDatagram::unbound().and_then(|s| s.send_to(&[], path));
    if let Err(e) = pill {
        debug!(path = %path.display(), error = %e, "Poison pill not delivered");
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_oversized(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EMSGSIZE)
}

fn answer_ping(request: &str, allow_ping: bool) -> Option<String> {
    (allow_ping && request == PING).then(|| PONG.to_string())
}

/// Async-task server
pub struct SocketServer {
    path: PathBuf,
    handler: Arc<dyn Handler>,
    allow_ping: bool,
    state: Lifecycle<JoinHandle<()>>,
}

impl SocketServer {
    pub fn new(path: impl Into<PathBuf>, handler: Arc<dyn Handler>) -> Self {
        Self {
            path: path.into(),
            handler,
            allow_ping: true,
            state: Lifecycle::Created,
        }
    }

    pub fn with_ping(mut self, allow: bool) -> Self {
        self.allow_ping = allow;
        self
    }
}

async fn reply(socket: &UnixDatagram, response: &str, peer: &Path) {
    match socket.send_to(response.as_bytes(), peer).await {
        Ok(_) => {}
        Err(e) if is_oversized(&e) => {
            error!(peer = %peer.display(), size = response.len(), "Reply too large, dropped")
        }
        Err(e) => warn!(peer = %peer.display(), error = %e, "Reply not sent"),
    }
}

async fn serve(socket: Arc<UnixDatagram>, handler: Arc<dyn Handler>, allow_ping: bool) {
    let mut buf = vec![0u8; RECV_BUFFER_LENGTH];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!(error = %e, "Receive failed, server loop ends");
                break;
            }
        };
        if len == 0 {
            debug!("Poison pill received");
            break;
        }

        let request = String::from_utf8_lossy(&buf[..len]).into_owned();
        let peer = peer.as_pathname().map(Path::to_path_buf);
        let socket = socket.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            let response = match answer_ping(&request, allow_ping) {
                Some(pong) => Some(pong),
                None => handler.handle(request).await,
            };
            match (response, peer) {
                (Some(response), Some(peer)) => reply(&socket, &response, &peer).await,
                (Some(_), None) => debug!("Unnamed peer, reply skipped"),
                (None, _) => {}
            }
        });
    }
}

impl EndpointServer for SocketServer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn start(&mut self) -> Result<(), IpcError> {
        match self.state {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopped => return Err(IpcError::StoppedAlready),
            Lifecycle::Created => {}
        }

        tokio::runtime::Handle::try_current().map_err(|e| IpcError::NoRuntime(e.to_string()))?;
        let std_socket = bind_std(&self.path)?;
        std_socket.set_nonblocking(true)?;
        let socket = UnixDatagram::from_std(std_socket)?;

        let handle = tokio::spawn(serve(
            Arc::new(socket),
            self.handler.clone(),
            self.allow_ping,
        ));
        self.state = Lifecycle::Running(handle);
        info!(path = %self.path.display(), shape = "async", "API server started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IpcError> {
        match std::mem::replace(&mut self.state, Lifecycle::Stopped) {
            Lifecycle::Created => {
                self.state = Lifecycle::Created;
                Ok(())
            }
            Lifecycle::Stopped => Ok(()),
            Lifecycle::Running(handle) => {
                let result = poison_and_remove(&self.path);
                handle.abort();
                info!(path = %self.path.display(), "API server stopped");
                result
            }
        }
    }
}

/// Dedicated-thread server
pub struct BlockingSocketServer {
    path: PathBuf,
    handler: Arc<dyn Handler>,
    allow_ping: bool,
    state: Lifecycle<ThreadHandle<()>>,
}

impl BlockingSocketServer {
    pub fn new(path: impl Into<PathBuf>, handler: Arc<dyn Handler>) -> Self {
        Self {
            path: path.into(),
            handler,
            allow_ping: true,
            state: Lifecycle::Created,
        }
    }

    pub fn with_ping(mut self, allow: bool) -> Self {
        self.allow_ping = allow;
        self
    }
}

fn serve_blocking(
    socket: StdUnixDatagram,
    handler: Arc<dyn Handler>,
    allow_ping: bool,
    runtime: tokio::runtime::Handle,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LENGTH];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Receive failed, server loop ends");
                break;
            }
        };
        if len == 0 {
            debug!("Poison pill received");
            break;
        }

        let request = String::from_utf8_lossy(&buf[..len]).into_owned();
        let response = match answer_ping(&request, allow_ping) {
            Some(pong) => Some(pong),
            None => runtime.block_on(handler.handle(request)),
        };
        let Some(response) = response else {
            continue;
        };
        let Some(peer) = peer.as_pathname() else {
            debug!("Unnamed peer, reply skipped");
            continue;
        };
        match socket.send_to(response.as_bytes(), peer) {
            Ok(_) => {}
            Err(e) if is_oversized(&e) => {
                error!(peer = %peer.display(), size = response.len(), "Reply too large, dropped")
            }
            Err(e) => warn!(peer = %peer.display(), error = %e, "Reply not sent"),
        }
    }
}

impl EndpointServer for BlockingSocketServer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn start(&mut self) -> Result<(), IpcError> {
        match self.state {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopped => return Err(IpcError::StoppedAlready),
            Lifecycle::Created => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| IpcError::NoRuntime(e.to_string()))?;
        let socket = bind_std(&self.path)?;
        let handler = self.handler.clone();
        let allow_ping = self.allow_ping;

        let thread = std::thread::Builder::new()
            .name("synaps-api".to_string())
            .spawn(move || serve_blocking(socket, handler, allow_ping, runtime))?;
        self.state = Lifecycle::Running(thread);
        info!(path = %self.path.display(), shape = "blocking", "API server started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IpcError> {
        match std::mem::replace(&mut self.state, Lifecycle::Stopped) {
            Lifecycle::Created => {
                self.state = Lifecycle::Created;
                Ok(())
            }
            Lifecycle::Stopped => Ok(()),
            Lifecycle::Running(_thread) => {
                // The thread exits on the pill; it is not joined because a
                // handler may still be waiting on the runtime we are called from.
                let result = poison_and_remove(&self.path);
                info!(path = %self.path.display(), "API server stopped");
                result
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Drop for BlockingSocketServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
