//! Proxy server: listener, accept loop and drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_control::{
    CommandHandshake, ConnectionTracker, HandshakeConfig, ShutdownSignal, TunnelBroker,
    TunnelHandshake,
};
use burrow_router::RouteRegistry;
use burrow_transport::{client_connector, BackendDialer, StreamAcceptor, TransportError};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ProxyConfig};
use crate::dispatcher::{dispatch, DispatchContext};

const BIND_ATTEMPTS: u32 = 3;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProxyServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How the server finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight connection completed
    Drained,
    /// The drain was cut short with `remaining` connections still open
    Forced { remaining: usize },
}

/// Builder for [`ProxyServer`]
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    tunnel_password: String,
    control_password: Option<String>,
    registry: Option<Arc<RouteRegistry>>,
    shutdown: Option<ShutdownSignal>,
}

impl ProxyServerBuilder {
    pub fn tunnel_password(mut self, password: impl Into<String>) -> Self {
        self.tunnel_password = password.into();
        self
    }

    /// Defaults to the tunnel password
    pub fn control_password(mut self, password: impl Into<String>) -> Self {
        self.control_password = Some(password.into());
        self
    }

    pub fn registry(mut self, registry: Arc<RouteRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build TLS state, seed the registry from the configured servers, and
    /// bind the listener
    pub async fn bind(self) -> Result<ProxyServer, ProxyServerError> {
        let config = self.config;
        config.validate()?;
        let listen_addr = config.listen_addr()?;

        let acceptor = match config.tls_paths() {
            Some((cert, key)) => StreamAcceptor::from_pem(&cert, &key)?,
            None => StreamAcceptor::Plain,
        };
        let connector = client_connector(&config.client_trust())?;
        let dialer = BackendDialer::new(connector, config.timeouts.dial());

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(RouteRegistry::new()));
        let summary = registry.replace_static(config.routes());
        info!(
            routes = summary.inserted,
            skipped = summary.skipped,
            "Loaded configured routes"
        );

        let shutdown = self.shutdown.unwrap_or_default();
        let broker = Arc::new(TunnelBroker::new());

        let mut handshake = HandshakeConfig::new(self.tunnel_password)
            .with_read_timeout(config.timeouts.handshake_read())
            .with_publish_timeout(config.timeouts.tunnel_publish());
        if let Some(password) = self.control_password {
            handshake = handshake.with_control_password(password);
        }
        let handshake = Arc::new(handshake);

        let listener = bind_with_retry(listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let context = Arc::new(DispatchContext {
            registry: registry.clone(),
            broker: broker.clone(),
            dialer,
            acceptor,
            tunnel_handshake: TunnelHandshake::new(registry.clone(), broker, handshake.clone()),
            command_handshake: CommandHandshake::new(registry.clone(), shutdown.clone(), handshake),
            shutdown: shutdown.clone(),
            timeouts: config.timeouts.clone(),
        });

        Ok(ProxyServer {
            listener,
            local_addr,
            registry,
            context,
            shutdown,
            tracker: ConnectionTracker::new(),
        })
    }
}

async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, ProxyServerError> {
    // TIME_WAIT from a previous run can hold the port briefly
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        addr, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in 1 second...",
                    addr.port(),
                    attempt,
                    BIND_ATTEMPTS
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(ProxyServerError::BindError {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(ProxyServerError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
    })
}

/// A bound proxy server
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<RouteRegistry>,
    context: Arc<DispatchContext>,
    shutdown: ShutdownSignal,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            tunnel_password: String::new(),
            control_password: None,
            registry: None,
            shutdown: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<RouteRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until shutdown, then drain.
    ///
    /// The listener is closed as soon as shutdown begins. The drain ends when
    /// the last connection closes, or early on a forced shutdown or an expired
    /// hard deadline.
    pub async fn run(self) -> ShutdownOutcome {
        let ProxyServer {
            listener,
            local_addr,
            context,
            shutdown,
            tracker,
            ..
        } = self;

        info!(
            addr = %local_addr,
            tls = context.acceptor.is_tls(),
            "Proxy listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.stopped() => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let guard = tracker.enter();
                        tokio::spawn(dispatch(context.clone(), tcp, peer, guard));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        info!(active = tracker.active(), "Listener closed, draining connections");

        tokio::select! {
            biased;
            _ = tracker.wait_idle() => {
                info!("All connections drained");
                ShutdownOutcome::Drained
            }
            _ = shutdown.expired() => {
                let remaining = tracker.active();
                warn!(remaining, "Drain cut short");
                ShutdownOutcome::Forced { remaining }
            }
        }
    }
}
