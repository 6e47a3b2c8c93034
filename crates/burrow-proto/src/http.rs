//! Minimal HTTP/1.x handling
//!
//! The proxy never parses a full request. It reads the request line to pick a
//! route, rewrites the request target and adds a `Forwarded` header; every other
//! byte passes through untouched.

use std::net::SocketAddr;
use std::sync::OnceLock;

use regex_lite::Regex;

pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";
pub const INTERNAL_SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
pub const GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";

/// Segments answered locally with 404, never routed
const RESERVED_SEGMENTS: &[&str] = &["", "favicon.ico"];

fn request_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(\w+) /([^/?\s]*)(\S*) (HTTP\S*)\s*$").expect("request line regex is valid")
    })
}

/// The routable parts of an HTTP request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// First path segment, used as the route key
    pub segment: String,
    /// Everything in the target after the segment (starts with `/`, `?`, or is empty)
    pub rest: String,
    pub version: String,
    /// Offset just past the request line's terminator, or the buffer length
    line_end: usize,
    terminated: bool,
}

impl RequestHead {
    /// Parse the request line at the start of `buf`.
    ///
    /// If `buf` holds no line feed, the whole buffer is taken as the request line.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (line, line_end, terminated) = match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => (&buf[..pos], pos + 1, true),
            None => (buf, buf.len(), false),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = std::str::from_utf8(line).ok()?;

        let captures = request_line_regex().captures(line)?;
        Some(Self {
            method: captures[1].to_string(),
            segment: captures[2].to_string(),
            rest: captures[3].to_string(),
            version: captures[4].to_string(),
            line_end,
            terminated,
        })
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_SEGMENTS.contains(&self.segment.as_str())
    }

    /// Registry key for this request
    pub fn route_path(&self) -> String {
        format!("/{}", self.segment)
    }

    /// Request target with the routing segment removed
    pub fn target(&self) -> String {
        if self.rest.is_empty() {
            "/".to_string()
        } else if self.rest.starts_with('?') {
            format!("/{}", self.rest)
        } else {
            self.rest.clone()
        }
    }

    fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target(), self.version)
    }

    /// Rewrite only the request line; the remainder of `buf` is kept verbatim
    pub fn strip_segment(&self, buf: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(buf.len() + 2);
        out.extend_from_slice(self.request_line().as_bytes());
        if self.terminated {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(&buf[self.line_end..]);
        out
    }

    /// Rewrite the request line and add a `Forwarded` header for `client`.
    ///
    /// The header goes before the blank line that ends the header block. When
    /// that blank line is not in `buf`, it goes directly after the request line.
    pub fn rewrite(&self, buf: &[u8], client: SocketAddr) -> Vec<u8> {
        let header = format!("Forwarded: for=\"{}\"", client);
        let rest = &buf[self.line_end..];

        let mut out = Vec::with_capacity(buf.len() + header.len() + 4);
        out.extend_from_slice(self.request_line().as_bytes());
        out.extend_from_slice(b"\r\n");

        if !self.terminated {
            // the client's next bytes start with the line ending
            out.extend_from_slice(header.as_bytes());
            return out;
        }

        let insert_at = if rest.starts_with(b"\r\n") || rest.starts_with(b"\n") {
            0
        } else {
            find(rest, b"\r\n\r\n").map(|pos| pos + 2).unwrap_or(0)
        };

        out.extend_from_slice(&rest[..insert_at]);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&rest[insert_at..]);
        out
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
