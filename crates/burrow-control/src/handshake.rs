//! Handshake processors for the tunnel and control-command protocols
//!
//! Both processors receive the stream right after the dispatcher has consumed
//! the magic prefix, along with whatever else arrived in the first read. Every
//! request gets exactly one response frame unless the peer disappears first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_proto::{
    Command, CommandRequest, Decoded, FrameError, Protocol, Response, ServerInfo, TunnelRequest,
};
use burrow_router::{
    validate_segment, BackendDescriptor, InsertOutcome, RouteOrigin, RouteRegistry,
};
use burrow_transport::BoxedStream;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, TunnelBroker};
use crate::shutdown::ShutdownSignal;

const INVALID_SERVER_NAME: &str = "invalid server name";
const SERVER_NAME_EXISTS: &str = "server name already exists";
const INVALID_SERVER_INFO: &str = "invalid server info";
const TUNNEL_NOT_ALLOWED: &str = "cannot add tunnel server";
const SERVER_PATH_EXISTS: &str = "server path already exists";
const INVALID_SERVER_PATH: &str = "invalid server path";
const LENGTH_MISMATCH: &str = "content length mismatch";

/// Handshake settings shared by both processors
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub tunnel_password: String,
    /// Falls back to the tunnel password when unset
    pub control_password: Option<String>,
    /// Bound on each read while completing a request
    pub read_timeout: Duration,
    /// How long an authenticated tunnel waits to be claimed
    pub publish_timeout: Duration,
}

impl HandshakeConfig {
    pub fn new(tunnel_password: impl Into<String>) -> Self {
        Self {
            tunnel_password: tunnel_password.into(),
            control_password: None,
            read_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_control_password(mut self, password: impl Into<String>) -> Self {
        self.control_password = Some(password.into());
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn control_password(&self) -> &str {
        self.control_password
            .as_deref()
            .unwrap_or(&self.tunnel_password)
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake read timed out")]
    ReadTimeout,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Read from `stream` until `decode` yields a complete request.
///
/// Never reads past the declared length, so only bytes that arrived with the
/// first read can cause a mismatch.
async fn read_request<T, F>(
    stream: &mut BoxedStream,
    mut body: Vec<u8>,
    read_timeout: Duration,
    decode: F,
) -> Result<T, HandshakeError>
where
    F: Fn(&[u8]) -> Result<Decoded<T>, FrameError>,
{
    loop {
        match decode(&body)? {
            Decoded::Complete(request) => return Ok(request),
            Decoded::Incomplete { needed } => {
                let mut chunk = vec![0u8; needed];
                let n = tokio::time::timeout(read_timeout, stream.read(&mut chunk))
                    .await
                    .map_err(|_| HandshakeError::ReadTimeout)??;
                if n == 0 {
                    return Err(HandshakeError::Closed);
                }
                body.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

async fn respond(
    stream: &mut BoxedStream,
    protocol: Protocol,
    response: &Response,
) -> Result<(), HandshakeError> {
    stream.write_all(&response.encode(protocol)).await?;
    stream.flush().await?;
    Ok(())
}

/// Answer a request that could not be read in full
async fn reject_unreadable(
    stream: &mut BoxedStream,
    protocol: Protocol,
    err: HandshakeError,
) -> HandshakeError {
    if matches!(err, HandshakeError::Frame(_) | HandshakeError::ReadTimeout) {
        let _ = respond(stream, protocol, &Response::error(LENGTH_MISMATCH)).await;
    }
    err
}

/// Authenticates tunnels and parks them with the broker
pub struct TunnelHandshake {
    registry: Arc<RouteRegistry>,
    broker: Arc<TunnelBroker>,
    config: Arc<HandshakeConfig>,
}

impl TunnelHandshake {
    pub fn new(
        registry: Arc<RouteRegistry>,
        broker: Arc<TunnelBroker>,
        config: Arc<HandshakeConfig>,
    ) -> Self {
        Self {
            registry,
            broker,
            config,
        }
    }

    /// Handle a tunnel handshake. `body` holds the bytes after the magic prefix.
    ///
    /// Returns once the tunnel has been handed to a client, or has been
    /// rejected, expired, or closed.
    pub async fn serve(
        &self,
        mut stream: BoxedStream,
        peer: SocketAddr,
        body: Vec<u8>,
    ) -> Result<(), HandshakeError> {
        let read = read_request(
            &mut stream,
            body,
            self.config.read_timeout,
            TunnelRequest::decode,
        )
        .await;
        let request = match read {
            Ok(request) => request,
            Err(err) => return Err(reject_unreadable(&mut stream, Protocol::Tunnel, err).await),
        };

        if request.password != self.config.tunnel_password.as_bytes() {
            warn!(peer = %peer, "Tunnel handshake with invalid password");
            respond(&mut stream, Protocol::Tunnel, &Response::InvalidPassword).await?;
            return Err(HandshakeError::InvalidPassword);
        }

        let name = match String::from_utf8(request.name) {
            Ok(name) if validate_segment(&name).is_ok() => name,
            _ => return self.reject(&mut stream, INVALID_SERVER_NAME).await,
        };
        let path = format!("/{}", name);

        let descriptor = BackendDescriptor::tunnel(&path).with_name(&name);
        match self.registry.insert_if_absent(descriptor) {
            Ok(InsertOutcome::Inserted { evicted }) => {
                info!(path = %path, peer = %peer, "Tunnel registered");
                for old in evicted {
                    warn!(
                        path = %old.path,
                        name = %name,
                        "Route replaced by tunnel with the same name"
                    );
                }
            }
            Ok(InsertOutcome::Existing(existing)) if existing.tunnel => {
                debug!(path = %path, peer = %peer, "Additional tunnel connection");
            }
            Ok(InsertOutcome::Existing(_)) => {
                warn!(path = %path, peer = %peer, "Tunnel name collides with a dialed backend");
                return self.reject(&mut stream, SERVER_NAME_EXISTS).await;
            }
            Err(_) => return self.reject(&mut stream, INVALID_SERVER_NAME).await,
        }

        respond(&mut stream, Protocol::Tunnel, &Response::Success).await?;

        match self
            .broker
            .publish(&path, stream, self.config.publish_timeout)
            .await
        {
            Ok(()) => {
                debug!(path = %path, peer = %peer, "Tunnel matched with client");
                Ok(())
            }
            Err(err) => {
                debug!(path = %path, peer = %peer, error = %err, "Tunnel released");
                Err(err.into())
            }
        }
    }

    async fn reject(&self, stream: &mut BoxedStream, message: &str) -> Result<(), HandshakeError> {
        respond(stream, Protocol::Tunnel, &Response::error(message)).await?;
        Err(HandshakeError::Rejected(message.to_string()))
    }
}

/// Executes control-plane commands
pub struct CommandHandshake {
    registry: Arc<RouteRegistry>,
    shutdown: ShutdownSignal,
    config: Arc<HandshakeConfig>,
}

impl CommandHandshake {
    pub fn new(
        registry: Arc<RouteRegistry>,
        shutdown: ShutdownSignal,
        config: Arc<HandshakeConfig>,
    ) -> Self {
        Self {
            registry,
            shutdown,
            config,
        }
    }

    /// Handle a command handshake. `body` holds the bytes after the magic prefix.
    ///
    /// Loopback peers are trusted without a password.
    pub async fn serve(
        &self,
        mut stream: BoxedStream,
        peer: SocketAddr,
        body: Vec<u8>,
    ) -> Result<Response, HandshakeError> {
        let read = read_request(
            &mut stream,
            body,
            self.config.read_timeout,
            CommandRequest::decode,
        )
        .await;
        let request = match read {
            Ok(request) => request,
            Err(err) => return Err(reject_unreadable(&mut stream, Protocol::Command, err).await),
        };

        let trusted = peer.ip().to_canonical().is_loopback();
        if !trusted && request.password != self.config.control_password().as_bytes() {
            warn!(peer = %peer, "Control command with invalid password");
            respond(&mut stream, Protocol::Command, &Response::InvalidPassword).await?;
            return Err(HandshakeError::InvalidPassword);
        }

        let response = self.execute(&request.message, peer);
        respond(&mut stream, Protocol::Command, &response).await?;
        Ok(response)
    }

    /// Apply a JSON command to the registry or shutdown signal
    pub fn execute(&self, message: &[u8], peer: SocketAddr) -> Response {
        let command = match Command::from_json(message) {
            Ok(command) => command,
            Err(err) => {
                debug!(peer = %peer, error = %err, "Rejected control command");
                return Response::error(err.to_string());
            }
        };

        info!(peer = %peer, action = command.action(), "Control command");
        match command {
            Command::Add(info) => self.add(info),
            Command::Remove(info) => self.remove(info),
            Command::Shutdown { grace } => {
                self.shutdown.shutdown(grace);
                Response::Success
            }
        }
    }

    fn add(&self, info: ServerInfo) -> Response {
        if info.name.is_empty() || info.addr.is_empty() {
            return Response::error(INVALID_SERVER_INFO);
        }
        if info.tunnel {
            return Response::error(TUNNEL_NOT_ALLOWED);
        }
        let Some(path) = info.route_path() else {
            return Response::error(INVALID_SERVER_INFO);
        };

        let descriptor = BackendDescriptor::dialed(path, &info.addr)
            .with_name(&info.name)
            .with_secure(info.secure)
            .with_website(info.website)
            .with_origin(RouteOrigin::Control);

        match self.registry.insert_if_absent(descriptor) {
            Ok(InsertOutcome::Inserted { evicted }) => {
                for old in evicted {
                    warn!(
                        name = %info.name,
                        path = %old.path,
                        "Server name already registered, replaced older route"
                    );
                }
                Response::Success
            }
            Ok(InsertOutcome::Existing(_)) => Response::error(SERVER_PATH_EXISTS),
            Err(_) => Response::error(INVALID_SERVER_PATH),
        }
    }

    fn remove(&self, info: ServerInfo) -> Response {
        if let Some(path) = info.route_path() {
            self.registry.remove(&path);
            return Response::Success;
        }
        if !info.addr.is_empty() {
            self.registry.remove_by_address(&info.addr);
            return Response::Success;
        }
        Response::error(INVALID_SERVER_INFO)
    }
}
