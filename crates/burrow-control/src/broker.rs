//! Pairs parked tunnel connections with inbound client requests
//!
//! Each path has a hand-off slot: a bounded channel of capacity one carrying a
//! ticket. A publisher holding an authenticated tunnel stream puts a ticket in
//! the slot and keeps the stream until a claimant redeems it. Meanwhile the
//! publisher watches the idle stream, so a tunnel that dies while parked is
//! dropped instead of handed out. Further publishers for the same path queue
//! on the channel. A slot is dropped once nobody is waiting on it.

use std::sync::Arc;
use std::time::Duration;

use burrow_transport::BoxedStream;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, trace};

/// Channel the publisher delivers its stream on
type Delivery = oneshot::Sender<BoxedStream>;

/// Redeemed by a claimant to receive a stream
type Ticket = oneshot::Sender<Delivery>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("No client claimed tunnel {0} in time")]
    PublishExpired(String),

    #[error("Tunnel {0} closed while waiting for a client")]
    TunnelClosed(String),

    #[error("No tunnel available for {0}")]
    ClaimTimedOut(String),
}

struct HandoffSlot {
    tickets: mpsc::Sender<Ticket>,
    claims: Mutex<mpsc::Receiver<Ticket>>,
}

impl HandoffSlot {
    fn new() -> Self {
        let (tickets, claims) = mpsc::channel(1);
        Self {
            tickets,
            claims: Mutex::new(claims),
        }
    }
}

/// Keeps a path's slot alive while a publisher or claimant uses it.
///
/// The last lease to go drops the slot from the broker.
struct SlotLease<'a> {
    broker: &'a TunnelBroker,
    path: &'a str,
    slot: Option<Arc<HandoffSlot>>,
}

impl std::ops::Deref for SlotLease<'_> {
    type Target = HandoffSlot;

    fn deref(&self) -> &HandoffSlot {
        // only taken in drop
        self.slot.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        drop(self.slot.take());
        // entry() takes the same shard lock, so no new lease can race this
        let released = self
            .broker
            .slots
            .remove_if(self.path, |_, slot| Arc::strong_count(slot) == 1);
        if released.is_some() {
            trace!(path = %self.path, "Released tunnel slot");
        }
    }
}

enum Parked<T> {
    Ready(T),
    Expired,
    PeerActivity,
}

/// Tunnel broker keyed by route path
pub struct TunnelBroker {
    slots: DashMap<String, Arc<HandoffSlot>>,
}

impl TunnelBroker {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn slot<'a>(&'a self, path: &'a str) -> SlotLease<'a> {
        let slot = self
            .slots
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(HandoffSlot::new()))
            .clone();
        SlotLease {
            broker: self,
            path,
            slot: Some(slot),
        }
    }

    /// Park `stream` until a claimant for `path` takes it.
    ///
    /// Fails if nobody claims it within `wait`, or if the peer closes or sends
    /// anything while parked. On failure the stream is dropped.
    pub async fn publish(
        &self,
        path: &str,
        mut stream: BoxedStream,
        wait: Duration,
    ) -> Result<(), BrokerError> {
        let deadline = Instant::now() + wait;
        let slot = self.slot(path);
        let mut probe = [0u8; 1];

        loop {
            let (ticket, redeemed) = oneshot::channel::<Delivery>();

            let queued = tokio::select! {
                sent = slot.tickets.send(ticket) => Parked::Ready(sent.is_ok()),
                _ = sleep_until(deadline) => Parked::Expired,
                _ = stream.read(&mut probe) => Parked::PeerActivity,
            };
            match queued {
                Parked::Ready(true) => {}
                Parked::Ready(false) | Parked::PeerActivity => {
                    return Err(BrokerError::TunnelClosed(path.to_string()))
                }
                Parked::Expired => return Err(BrokerError::PublishExpired(path.to_string())),
            }
            trace!(path = %path, "Tunnel parked");

            let delivery = tokio::select! {
                delivery = redeemed => Parked::Ready(delivery.ok()),
                _ = sleep_until(deadline) => Parked::Expired,
                _ = stream.read(&mut probe) => Parked::PeerActivity,
            };
            let delivery = match delivery {
                Parked::Ready(Some(delivery)) => delivery,
                // claimant gave up after taking the ticket
                Parked::Ready(None) => continue,
                Parked::PeerActivity => return Err(BrokerError::TunnelClosed(path.to_string())),
                Parked::Expired => return Err(BrokerError::PublishExpired(path.to_string())),
            };

            match delivery.send(stream) {
                Ok(()) => {
                    debug!(path = %path, "Tunnel handed to client");
                    return Ok(());
                }
                Err(returned) => {
                    stream = returned;
                    continue;
                }
            }
        }
    }

    /// Take the next parked tunnel stream for `path`, waiting up to `wait`
    pub async fn claim(&self, path: &str, wait: Duration) -> Result<BoxedStream, BrokerError> {
        let deadline = Instant::now() + wait;
        let slot = self.slot(path);

        let attempt = async {
            let mut claims = slot.claims.lock().await;
            loop {
                let Some(ticket) = claims.recv().await else {
                    return None;
                };
                let (delivery, delivered) = oneshot::channel();
                if ticket.send(delivery).is_err() {
                    trace!(path = %path, "Discarding stale tunnel ticket");
                    continue;
                }
                match delivered.await {
                    Ok(stream) => return Some(stream),
                    Err(_) => continue,
                }
            }
        };

        match timeout_at(deadline, attempt).await {
            Ok(Some(stream)) => Ok(stream),
            _ => Err(BrokerError::ClaimTimedOut(path.to_string())),
        }
    }
}

impl Default for TunnelBroker {
    fn default() -> Self {
        Self::new()
    }
}
