//! Burrow Protocol Definitions
//!
//! This crate defines the wire formats spoken on the proxy's single listening
//! port: the tunnel handshake, the control-command handshake, and the handful
//! of literal HTTP/1.x responses the proxy writes on its own behalf.
//!
//! Every connection is classified from its first two bytes. The two binary
//! protocols are identified by a fixed magic prefix; anything else is treated
//! as the start of an HTTP/1.x request.

pub mod command;
pub mod frame;
pub mod http;

pub use command::{Command, CommandError, CommandMessage, ServerInfo};
pub use frame::{
    CommandRequest, Decoded, FrameError, Inbound, Protocol, Response, TunnelRequest,
};
pub use http::{
    RequestHead, BAD_REQUEST, GATEWAY_TIMEOUT, INTERNAL_SERVER_ERROR, NOT_FOUND,
};

/// Magic prefix of a tunnel handshake (31623, big-endian)
pub const TUNNEL_MAGIC: [u8; 2] = [0x7B, 0x87];

/// Magic prefix of a control-command handshake (3375, big-endian)
pub const COMMAND_MAGIC: [u8; 2] = [0x0D, 0x2F];

/// Size of the buffer used for the first read on every accepted connection
pub const INITIAL_READ_SIZE: usize = 2048;
