//! Per-connection dispatch
//!
//! Reads the first chunk of every connection, classifies it once, and hands it
//! to the tunnel handshake, the command handshake, or the HTTP router.

use std::net::SocketAddr;
use std::sync::Arc;

use burrow_control::{
    CommandHandshake, ConnectionGuard, HandshakeError, ShutdownSignal, TunnelBroker,
    TunnelHandshake,
};
use burrow_proto::{
    Inbound, RequestHead, BAD_REQUEST, GATEWAY_TIMEOUT, INITIAL_READ_SIZE,
    INTERNAL_SERVER_ERROR, NOT_FOUND,
};
use burrow_router::RouteRegistry;
use burrow_transport::{spawn_duplex, BackendDialer, BoxedStream, StreamAcceptor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TimeoutsConfig;

/// Shared state every connection task dispatches against
pub(crate) struct DispatchContext {
    pub registry: Arc<RouteRegistry>,
    pub broker: Arc<TunnelBroker>,
    pub dialer: BackendDialer,
    pub acceptor: StreamAcceptor,
    pub tunnel_handshake: TunnelHandshake,
    pub command_handshake: CommandHandshake,
    pub shutdown: ShutdownSignal,
    pub timeouts: TimeoutsConfig,
}

/// Service one accepted connection. `guard` keeps it counted until the
/// connection is fully closed.
pub(crate) async fn dispatch(
    ctx: Arc<DispatchContext>,
    tcp: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
) {
    let _guard = guard;
    let conn_id = Uuid::new_v4();

    let mut stream = match ctx
        .acceptor
        .accept(tcp, ctx.timeouts.tls_handshake())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            debug!(conn = %conn_id, peer = %peer, error = %e, "TLS accept failed");
            return;
        }
    };

    let mut buf = vec![0u8; INITIAL_READ_SIZE];
    let n = match tokio::time::timeout(ctx.timeouts.initial_read(), stream.read(&mut buf)).await
    {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!(conn = %conn_id, peer = %peer, error = %e, "Initial read failed");
            return;
        }
        Err(_) => {
            debug!(conn = %conn_id, peer = %peer, "Initial read timed out");
            return;
        }
    };
    buf.truncate(n);

    let Some(inbound) = Inbound::classify(&buf) else {
        debug!(conn = %conn_id, peer = %peer, bytes = n, "Request too short");
        reply(stream, BAD_REQUEST).await;
        return;
    };

    match inbound {
        Inbound::Tunnel => {
            let body = buf.split_off(2);
            tokio::select! {
                result = ctx.tunnel_handshake.serve(stream, peer, body) => {
                    log_handshake(conn_id, peer, "tunnel", result.map(|_| ()));
                }
                _ = ctx.shutdown.stopped() => {
                    debug!(conn = %conn_id, peer = %peer, "Dropping parked tunnel on shutdown");
                }
            }
        }
        Inbound::Command => {
            let body = buf.split_off(2);
            let result = ctx.command_handshake.serve(stream, peer, body).await;
            log_handshake(conn_id, peer, "command", result.map(|_| ()));
        }
        Inbound::Http => route_http(&ctx, stream, peer, buf, conn_id).await,
    }
}

async fn route_http(
    ctx: &DispatchContext,
    client: BoxedStream,
    peer: SocketAddr,
    buf: Vec<u8>,
    conn_id: Uuid,
) {
    let Some(head) = RequestHead::parse(&buf) else {
        debug!(conn = %conn_id, peer = %peer, "Unparseable request line");
        reply(client, BAD_REQUEST).await;
        return;
    };

    if head.is_reserved() {
        reply(client, NOT_FOUND).await;
        return;
    }

    let path = head.route_path();
    let backend = match ctx.registry.lookup(&path) {
        Ok(backend) => backend,
        Err(_) => {
            debug!(conn = %conn_id, path = %path, "No route");
            reply(client, NOT_FOUND).await;
            return;
        }
    };

    let (mut upstream, payload) = if backend.tunnel {
        match ctx.broker.claim(&path, ctx.timeouts.tunnel_claim()).await {
            Ok(tunnel) => (tunnel, buf),
            Err(e) => {
                warn!(conn = %conn_id, path = %path, error = %e, "Tunnel claim failed");
                reply(client, GATEWAY_TIMEOUT).await;
                return;
            }
        }
    } else {
        match ctx.dialer.dial(&backend.address, backend.secure).await {
            Ok(stream) => (stream, head.rewrite(&buf, peer)),
            Err(e) => {
                warn!(
                    conn = %conn_id,
                    path = %path,
                    address = %backend.address,
                    error = %e,
                    "Backend dial failed"
                );
                reply(client, INTERNAL_SERVER_ERROR).await;
                return;
            }
        }
    };

    let written = match upstream.write_all(&payload).await {
        Ok(()) => upstream.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        warn!(conn = %conn_id, path = %path, error = %e, "Backend write failed");
        reply(client, INTERNAL_SERVER_ERROR).await;
        return;
    }

    debug!(
        conn = %conn_id,
        peer = %peer,
        path = %path,
        tunnel = backend.tunnel,
        "Forwarding"
    );
    let stats = spawn_duplex(client, upstream).join().await;
    debug!(
        conn = %conn_id,
        path = %path,
        sent = stats.client_to_backend,
        received = stats.backend_to_client,
        "Connection closed"
    );
}

/// Write a literal response and close
async fn reply(mut stream: BoxedStream, response: &[u8]) {
    let _ = stream.write_all(response).await;
    let _ = stream.shutdown().await;
}

fn log_handshake(
    conn_id: Uuid,
    peer: SocketAddr,
    protocol: &'static str,
    result: Result<(), HandshakeError>,
) {
    match result {
        Ok(()) => debug!(conn = %conn_id, peer = %peer, protocol, "Handshake complete"),
        Err(HandshakeError::Io(e)) => {
            debug!(conn = %conn_id, peer = %peer, protocol, error = %e, "Handshake connection lost")
        }
        Err(e) => debug!(conn = %conn_id, peer = %peer, protocol, error = %e, "Handshake ended"),
    }
}
