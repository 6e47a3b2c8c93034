//! Accepting client streams and dialing backends

use std::path::Path;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::trace;

use crate::tls::server_acceptor;
use crate::{BoxedStream, TransportError};

/// Wraps accepted TCP connections, optionally in TLS
#[derive(Clone)]
pub enum StreamAcceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl StreamAcceptor {
    pub fn from_pem(cert_path: &Path, key_path: &Path) -> Result<Self, TransportError> {
        Ok(StreamAcceptor::Tls(server_acceptor(cert_path, key_path)?))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, StreamAcceptor::Tls(_))
    }

    /// Complete the TLS handshake, if any, within `handshake_timeout`
    pub async fn accept(
        &self,
        tcp: TcpStream,
        handshake_timeout: Duration,
    ) -> Result<BoxedStream, TransportError> {
        let _ = tcp.set_nodelay(true);
        match self {
            StreamAcceptor::Plain => Ok(Box::new(tcp)),
            StreamAcceptor::Tls(acceptor) => {
                let tls = tokio::time::timeout(handshake_timeout, acceptor.accept(tcp))
                    .await
                    .map_err(|_| TransportError::HandshakeTimeout)?
                    .map_err(TransportError::Handshake)?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Dials backends, plain or TLS, under a connect timeout
#[derive(Clone)]
pub struct BackendDialer {
    connector: TlsConnector,
    timeout: Duration,
}

impl BackendDialer {
    pub fn new(connector: TlsConnector, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connect to `address`. The TLS handshake counts against the timeout.
    pub async fn dial(&self, address: &str, secure: bool) -> Result<BoxedStream, TransportError> {
        let connect = async {
            let tcp = TcpStream::connect(address)
                .await
                .map_err(|source| TransportError::Connect {
                    address: address.to_string(),
                    source,
                })?;
            let _ = tcp.set_nodelay(true);

            if !secure {
                trace!(address = %address, "Dialed backend");
                return Ok(Box::new(tcp) as BoxedStream);
            }

            let name = server_name(address)?;
            let tls = self
                .connector
                .connect(name, tcp)
                .await
                .map_err(TransportError::Handshake)?;
            trace!(address = %address, "Dialed backend over TLS");
            Ok(Box::new(tls) as BoxedStream)
        };

        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout(address.to_string()))?
    }
}

/// TLS server name for a `host:port` address
pub fn server_name(address: &str) -> Result<ServerName<'static>, TransportError> {
    let host = host_part(address);
    ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidServerName(host.to_string()))
}

fn host_part(address: &str) -> &str {
    if let Some(bracketed) = address.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    }
}
