//! Tunnel client
//!
//! Each worker dials the proxy, authenticates, and parks until the proxy hands
//! it an inbound request. The request is then bridged to the local target and
//! the worker dials again for the next one.

use std::sync::Arc;
use std::time::Duration;

use burrow_proto::{
    Protocol, RequestHead, TunnelRequest, INITIAL_READ_SIZE, INTERNAL_SERVER_ERROR,
};
use burrow_transport::{spawn_duplex, BoxedStream, ClientTrust, ForwardStats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{expect_success, read_response, ProxyConnector};
use crate::ClientError;

/// Tunnel client configuration
#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    /// Proxy address, e.g. "proxy.example.com:8000"
    pub proxy_addr: String,
    /// Route name; requests for `/<name>` arrive through this tunnel
    pub name: String,
    pub password: String,
    /// Local service every request is bridged to
    pub target_addr: String,
    /// TLS towards the proxy; `None` for plain TCP
    pub tls: Option<ClientTrust>,
    /// Tunnel connections parked at once
    pub concurrency: usize,
    pub connect_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl TunnelClientConfig {
    pub fn new(
        proxy_addr: impl Into<String>,
        name: impl Into<String>,
        password: impl Into<String>,
        target_addr: impl Into<String>,
    ) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            name: name.into(),
            password: password.into(),
            target_addr: target_addr.into(),
            tls: None,
            concurrency: 1,
            connect_timeout: Duration::from_secs(10),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }

    pub fn with_tls(mut self, trust: ClientTrust) -> Self {
        self.tls = Some(trust);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max.max(initial);
        self
    }
}

/// Tunnel client
pub struct TunnelClient {
    config: TunnelClientConfig,
    connector: ProxyConnector,
}

impl TunnelClient {
    pub fn new(config: TunnelClientConfig) -> Result<Self, ClientError> {
        let connector = ProxyConnector::new(
            config.proxy_addr.clone(),
            config.tls.clone(),
            config.connect_timeout,
        )?;
        Ok(Self { config, connector })
    }

    pub fn config(&self) -> &TunnelClientConfig {
        &self.config
    }

    /// Dial the proxy and authenticate; returns the parked stream
    pub async fn handshake(&self) -> Result<BoxedStream, ClientError> {
        let mut stream = self.connector.connect().await?;

        let request = TunnelRequest::new(
            self.config.name.as_bytes(),
            self.config.password.as_bytes(),
        );
        stream.write_all(&request.encode()?).await?;
        stream.flush().await?;

        let response =
            read_response(&mut stream, Protocol::Tunnel, self.config.connect_timeout).await?;
        expect_success(response)?;

        debug!(proxy = %self.connector.addr(), name = %self.config.name, "Tunnel parked");
        Ok(stream)
    }

    /// Park one tunnel connection and serve the request it is matched with.
    ///
    /// Returns `Ok(None)` when the proxy released the tunnel without a request.
    pub async fn serve_one(&self) -> Result<Option<ForwardStats>, ClientError> {
        let mut tunnel = self.handshake().await?;

        let mut buf = vec![0u8; INITIAL_READ_SIZE];
        let n = tunnel.read(&mut buf).await?;
        if n == 0 {
            debug!(name = %self.config.name, "Proxy released idle tunnel");
            return Ok(None);
        }
        buf.truncate(n);

        let payload = match RequestHead::parse(&buf) {
            Some(head) if head.segment == self.config.name => head.strip_segment(&buf),
            _ => buf,
        };

        let connect = TcpStream::connect(&self.config.target_addr);
        let mut target = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                warn!(target = %self.config.target_addr, error = %e, "Target unreachable");
                let _ = tunnel.write_all(INTERNAL_SERVER_ERROR).await;
                let _ = tunnel.shutdown().await;
                return Err(e.into());
            }
            Err(_) => {
                warn!(target = %self.config.target_addr, "Target connect timed out");
                let _ = tunnel.write_all(INTERNAL_SERVER_ERROR).await;
                let _ = tunnel.shutdown().await;
                return Err(ClientError::Timeout(format!(
                    "connecting to {}",
                    self.config.target_addr
                )));
            }
        };
        let _ = target.set_nodelay(true);
        target.write_all(&payload).await?;

        let stats = spawn_duplex(tunnel, target).join().await;
        debug!(
            name = %self.config.name,
            sent = stats.backend_to_client,
            received = stats.client_to_backend,
            "Request served"
        );
        Ok(Some(stats))
    }

    /// Keep `concurrency` tunnels parked until `shutdown` is cancelled.
    ///
    /// Transient failures are retried with exponential backoff. A rejected
    /// password or name stops every worker.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ClientError> {
        info!(
            proxy = %self.config.proxy_addr,
            name = %self.config.name,
            target = %self.config.target_addr,
            concurrency = self.config.concurrency,
            "Starting tunnel client"
        );

        let stop = shutdown.child_token();
        let mut workers = JoinSet::new();
        for worker in 0..self.config.concurrency.max(1) {
            workers.spawn(self.clone().worker(worker, stop.clone()));
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Tunnel client stopped");
                    stop.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Tunnel worker panicked");
                    stop.cancel();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn worker(
        self: Arc<Self>,
        worker: usize,
        stop: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut backoff = self.config.retry_initial;

        loop {
            let result = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                result = self.serve_one() => result,
            };

            match result {
                Ok(_) => backoff = self.config.retry_initial,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        worker,
                        error = %e,
                        retry_ms = backoff.as_millis() as u64,
                        "Tunnel attempt failed"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.retry_max);
                }
            }
        }
    }
}
