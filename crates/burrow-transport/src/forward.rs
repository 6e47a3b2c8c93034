//! Bidirectional forwarding between two established streams
//!
//! One task per direction. A direction ends on EOF, a read or write error, or
//! when the other direction has ended. The ending direction shuts down its
//! destination and cancels the shared token, so closing either side promptly
//! tears down both.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 32 * 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

impl ForwardStats {
    pub fn total(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

/// Handle on a running forwarder
pub struct DuplexHandle {
    upstream: JoinHandle<u64>,
    downstream: JoinHandle<u64>,
    cancel: CancellationToken,
}

impl DuplexHandle {
    /// Wait for both directions to finish
    pub async fn join(self) -> ForwardStats {
        let client_to_backend = self.upstream.await.unwrap_or(0);
        let backend_to_client = self.downstream.await.unwrap_or(0);
        ForwardStats {
            client_to_backend,
            backend_to_client,
        }
    }

    /// Stop both directions
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Forward bytes between `client` and `backend` until either side closes
pub fn spawn_duplex<C, B>(client: C, backend: B) -> DuplexHandle
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let cancel = CancellationToken::new();

    let upstream = tokio::spawn(pump(
        "client->backend",
        client_read,
        backend_write,
        cancel.clone(),
    ));
    let downstream = tokio::spawn(pump(
        "backend->client",
        backend_read,
        client_write,
        cancel.clone(),
    ));

    DuplexHandle {
        upstream,
        downstream,
        cancel,
    }
}

async fn pump<R, W>(
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log_io_error(direction, "read", &e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            result = writer.write_all(&buf[..n]) => result,
        };
        if let Err(e) = written {
            log_io_error(direction, "write", &e);
            break;
        }
        total += n as u64;
    }

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    cancel.cancel();

    debug!(direction, bytes = total, "Forwarding finished");
    total
}

fn is_teardown(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}

fn log_io_error(direction: &'static str, op: &'static str, e: &io::Error) {
    if is_teardown(e) {
        debug!(direction, op, error = %e, "Connection closed");
    } else {
        warn!(direction, op, error = %e, "Forwarding error");
    }
}
