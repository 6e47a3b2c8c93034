//! Graceful and forced shutdown signalling

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared shutdown state.
///
/// `shutdown` stops accepting new connections and lets in-flight ones drain.
/// `force` abandons the drain. A grace period passed to `shutdown` arms a hard
/// deadline; the earliest armed deadline wins.
#[derive(Clone)]
pub struct ShutdownSignal {
    graceful: CancellationToken,
    forced: CancellationToken,
    deadline: Arc<watch::Sender<Option<Instant>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            graceful: CancellationToken::new(),
            forced: CancellationToken::new(),
            deadline: Arc::new(deadline),
        }
    }

    /// Begin a graceful shutdown, optionally bounded by `grace`
    pub fn shutdown(&self, grace: Option<Duration>) {
        if !self.graceful.is_cancelled() {
            info!(grace_secs = grace.map(|g| g.as_secs()), "Shutdown requested");
        }
        self.graceful.cancel();

        if let Some(grace) = grace {
            let candidate = Instant::now() + grace;
            self.deadline.send_modify(|deadline| {
                *deadline = Some(match *deadline {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            });
        }
    }

    /// Stop immediately without draining
    pub fn force(&self) {
        info!("Forced shutdown requested");
        self.graceful.cancel();
        self.forced.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    /// Token cancelled when shutdown begins, for background tasks
    pub fn token(&self) -> CancellationToken {
        self.graceful.clone()
    }

    /// Resolve once shutdown has begun
    pub async fn stopped(&self) {
        self.graceful.cancelled().await
    }

    /// Resolve once the drain must be abandoned: on `force`, or when the hard
    /// deadline passes
    pub async fn expired(&self) {
        let mut deadline = self.deadline.subscribe();
        loop {
            let current = *deadline.borrow_and_update();
            let timer = async move {
                match current {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.forced.cancelled() => return,
                _ = timer => return,
                changed = deadline.changed() => {
                    if changed.is_err() {
                        self.forced.cancelled().await;
                        return;
                    }
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
