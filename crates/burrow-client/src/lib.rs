//! Clients for the burrow proxy
//!
//! - [`TunnelClient`]: exposes a local service through a proxy by parking
//!   authenticated tunnel connections that the proxy hands to inbound requests
//! - [`ControlClient`]: sends `add` / `remove` / `shutdown` commands

pub mod connection;
pub mod control;
pub mod tunnel;

use burrow_proto::{CommandError, FrameError};
use burrow_transport::TransportError;
use thiserror::Error;

pub use connection::ProxyConnector;
pub use control::ControlClient;
pub use tunnel::{TunnelClient, TunnelClientConfig};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to proxy failed: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Rejected by proxy: {0}")]
    Rejected(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Proxy closed the connection")]
    Closed,
}

impl ClientError {
    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::InvalidPassword | ClientError::Rejected(_))
    }
}
