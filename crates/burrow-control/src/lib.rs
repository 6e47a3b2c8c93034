//! Control plane for the proxy
//!
//! Handshake processing for the two binary protocols, the broker that pairs
//! parked tunnels with inbound requests, and the bookkeeping used to drain
//! connections on shutdown.

pub mod broker;
pub mod handshake;
pub mod shutdown;
pub mod tracker;

pub use broker::{BrokerError, TunnelBroker};
pub use handshake::{CommandHandshake, HandshakeConfig, HandshakeError, TunnelHandshake};
pub use shutdown::ShutdownSignal;
pub use tracker::{ConnectionGuard, ConnectionTracker};
