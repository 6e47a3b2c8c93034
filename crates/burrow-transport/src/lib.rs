//! Stream plumbing shared by the proxy and its clients
//!
//! - [`ProxyStream`]: any bidirectional byte stream, plain TCP or TLS
//! - [`StreamAcceptor`] / [`BackendDialer`]: listener-side TLS and bounded
//!   backend dialing
//! - [`spawn_duplex`]: the bidirectional forwarder

pub mod forward;
pub mod stream;
pub mod tls;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use forward::{spawn_duplex, DuplexHandle, ForwardStats};
pub use stream::{BackendDialer, StreamAcceptor};
pub use tls::{client_connector, server_acceptor, ClientTrust};

/// A bidirectional byte stream that can be moved across tasks
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Owned, type-erased stream
pub type BoxedStream = Box<dyn ProxyStream>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,
}
