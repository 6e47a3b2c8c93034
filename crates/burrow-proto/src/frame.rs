//! Binary handshake framing
//!
//! Tunnel request (after the 2-byte magic):
//! `[1B name len][1B password len][name][password]`
//!
//! Command request (after the 2-byte magic):
//! `[2B message len, BE][1B password len][1B pad = 0][message][password]`
//!
//! Responses for both protocols:
//! `[2B magic][1B code][1B message len][message]`

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{COMMAND_MAGIC, TUNNEL_MAGIC};

/// Response code for a successful handshake or command
pub const SUCCESS_CODE: u8 = 0x0F;

/// Response code for a rejected password
pub const INVALID_PASSWORD_CODE: u8 = 0x00;

/// Response code for any other failure; followed by a message
pub const ERROR_CODE: u8 = 0x0D;

/// Error messages are length-prefixed with a single byte
pub const MAX_ERROR_MESSAGE_LEN: usize = u8::MAX as usize;

/// Framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Content length mismatch: declared {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid magic prefix: {0:02x?}")]
    InvalidMagic([u8; 2]),

    #[error("Unknown response code: {0:#04x}")]
    UnknownResponseCode(u8),

    #[error("Response message is not valid UTF-8")]
    InvalidUtf8,
}

/// The two binary protocols multiplexed onto the proxy port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tunnel,
    Command,
}

impl Protocol {
    pub fn magic(self) -> [u8; 2] {
        match self {
            Protocol::Tunnel => TUNNEL_MAGIC,
            Protocol::Command => COMMAND_MAGIC,
        }
    }

    pub fn from_magic(prefix: [u8; 2]) -> Option<Self> {
        match prefix {
            TUNNEL_MAGIC => Some(Protocol::Tunnel),
            COMMAND_MAGIC => Some(Protocol::Command),
            _ => None,
        }
    }
}

/// What an accepted connection turned out to be, decided once from its first bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Http,
    Tunnel,
    Command,
}

impl Inbound {
    /// Classify a connection from the bytes of its first read.
    ///
    /// Returns `None` when fewer than two bytes are available.
    pub fn classify(initial: &[u8]) -> Option<Self> {
        let prefix: [u8; 2] = initial.get(..2)?.try_into().ok()?;
        Some(match Protocol::from_magic(prefix) {
            Some(Protocol::Tunnel) => Inbound::Tunnel,
            Some(Protocol::Command) => Inbound::Command,
            None => Inbound::Http,
        })
    }
}

/// Result of decoding a possibly partial buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    Complete(T),
    /// At least `needed` more bytes are required
    Incomplete { needed: usize },
}

/// A tunnel handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub name: Vec<u8>,
    pub password: Vec<u8>,
}

impl TunnelRequest {
    /// Header size after the magic prefix
    pub const HEADER_SIZE: usize = 2;

    pub fn new(name: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }

    /// Decode a request from the bytes following the magic prefix.
    ///
    /// The body must contain exactly the declared name and password; trailing
    /// bytes are a length mismatch.
    pub fn decode(body: &[u8]) -> Result<Decoded<Self>, FrameError> {
        if body.len() < Self::HEADER_SIZE {
            return Ok(Decoded::Incomplete {
                needed: Self::HEADER_SIZE - body.len(),
            });
        }

        let name_len = body[0] as usize;
        let password_len = body[1] as usize;
        let declared = name_len + password_len;
        let payload = &body[Self::HEADER_SIZE..];

        if payload.len() < declared {
            return Ok(Decoded::Incomplete {
                needed: declared - payload.len(),
            });
        }
        if payload.len() > declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Decoded::Complete(Self {
            name: payload[..name_len].to_vec(),
            password: payload[name_len..].to_vec(),
        }))
    }

    /// Encode the full request, magic prefix included
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        check_len("name", self.name.len(), u8::MAX as usize)?;
        check_len("password", self.password.len(), u8::MAX as usize)?;

        let mut buf = BytesMut::with_capacity(
            TUNNEL_MAGIC.len() + Self::HEADER_SIZE + self.name.len() + self.password.len(),
        );
        buf.put_slice(&TUNNEL_MAGIC);
        buf.put_u8(self.name.len() as u8);
        buf.put_u8(self.password.len() as u8);
        buf.put_slice(&self.name);
        buf.put_slice(&self.password);
        Ok(buf.freeze())
    }
}

/// A control-command handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// JSON-encoded command
    pub message: Vec<u8>,
    pub password: Vec<u8>,
}

impl CommandRequest {
    /// Header size after the magic prefix
    pub const HEADER_SIZE: usize = 4;

    pub fn new(message: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            message: message.into(),
            password: password.into(),
        }
    }

    /// Decode a request from the bytes following the magic prefix
    pub fn decode(body: &[u8]) -> Result<Decoded<Self>, FrameError> {
        if body.len() < Self::HEADER_SIZE {
            return Ok(Decoded::Incomplete {
                needed: Self::HEADER_SIZE - body.len(),
            });
        }

        let message_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let password_len = body[2] as usize;
        // body[3] is padding
        let declared = message_len + password_len;
        let payload = &body[Self::HEADER_SIZE..];

        if payload.len() < declared {
            return Ok(Decoded::Incomplete {
                needed: declared - payload.len(),
            });
        }
        if payload.len() > declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Decoded::Complete(Self {
            message: payload[..message_len].to_vec(),
            password: payload[message_len..].to_vec(),
        }))
    }

    /// Encode the full request, magic prefix included
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        check_len("message", self.message.len(), u16::MAX as usize)?;
        check_len("password", self.password.len(), u8::MAX as usize)?;

        let mut buf = BytesMut::with_capacity(
            COMMAND_MAGIC.len() + Self::HEADER_SIZE + self.message.len() + self.password.len(),
        );
        buf.put_slice(&COMMAND_MAGIC);
        buf.put_u16(self.message.len() as u16);
        buf.put_u8(self.password.len() as u8);
        buf.put_u8(0);
        buf.put_slice(&self.message);
        buf.put_slice(&self.password);
        Ok(buf.freeze())
    }
}

/// Handshake response shared by both binary protocols
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success,
    InvalidPassword,
    Error(String),
}

impl Response {
    /// Size of a response without its message
    pub const HEADER_SIZE: usize = 4;

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(message.into())
    }

    pub fn code(&self) -> u8 {
        match self {
            Response::Success => SUCCESS_CODE,
            Response::InvalidPassword => INVALID_PASSWORD_CODE,
            Response::Error(_) => ERROR_CODE,
        }
    }

    /// Encode the response framed with the protocol's magic prefix.
    ///
    /// Error messages longer than 255 bytes are cut at a character boundary.
    pub fn encode(&self, protocol: Protocol) -> Bytes {
        let message = match self {
            Response::Error(message) => truncate_message(message),
            _ => "",
        };

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + message.len());
        buf.put_slice(&protocol.magic());
        buf.put_u8(self.code());
        buf.put_u8(message.len() as u8);
        buf.put_slice(message.as_bytes());
        buf.freeze()
    }

    /// Decode a response, magic prefix included
    pub fn decode(protocol: Protocol, buf: &[u8]) -> Result<Decoded<Self>, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(Decoded::Incomplete {
                needed: Self::HEADER_SIZE - buf.len(),
            });
        }

        let magic = [buf[0], buf[1]];
        if magic != protocol.magic() {
            return Err(FrameError::InvalidMagic(magic));
        }

        let code = buf[2];
        let message_len = buf[3] as usize;
        let total = Self::HEADER_SIZE + message_len;
        if buf.len() < total {
            return Ok(Decoded::Incomplete {
                needed: total - buf.len(),
            });
        }

        let response = match code {
            SUCCESS_CODE => Response::Success,
            INVALID_PASSWORD_CODE => Response::InvalidPassword,
            ERROR_CODE => {
                let message = std::str::from_utf8(&buf[Self::HEADER_SIZE..total])
                    .map_err(|_| FrameError::InvalidUtf8)?;
                Response::Error(message.to_string())
            }
            other => return Err(FrameError::UnknownResponseCode(other)),
        };

        Ok(Decoded::Complete(response))
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), FrameError> {
    if len > max {
        return Err(FrameError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn truncate_message(message: &str) -> &str {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
