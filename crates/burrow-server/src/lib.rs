//! The burrow proxy server
//!
//! A single listening port serves three kinds of connection, told apart by
//! their first two bytes: HTTP/1.x requests routed by their first path
//! segment, tunnel handshakes, and control commands.

pub mod config;
mod dispatcher;
pub mod server;
pub mod watcher;

pub use config::{ConfigError, HealthCheckConfig, ProxyConfig, ServerRecord, TimeoutsConfig};
pub use server::{ProxyServer, ProxyServerBuilder, ProxyServerError, ShutdownOutcome};
pub use watcher::{ConfigWatcher, PollOutcome};
