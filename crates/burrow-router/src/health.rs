//! Background health probing for dialed backends

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ProbeOutcome, ProbeVerdict, RouteRegistry};

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between probe cycles
    pub interval: Duration,
    /// Bound on a single connect attempt
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Summary of one probe cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub suspect: Vec<String>,
    pub evicted: Vec<String>,
}

/// Connect to `address` and close immediately.
///
/// Only a refused connection counts against the backend. DNS failures and
/// timeouts are treated as reachable so a flaky resolver cannot empty the
/// registry.
pub async fn probe(address: &str, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => ProbeOutcome::Reachable,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => ProbeOutcome::Refused,
        Ok(Err(e)) => {
            debug!(address = %address, error = %e, "Probe failed, not counted");
            ProbeOutcome::Reachable
        }
        Err(_) => {
            debug!(address = %address, "Probe timed out, not counted");
            ProbeOutcome::Reachable
        }
    }
}

/// Periodically probes every dialed backend and evicts dead ones
pub struct HealthMonitor {
    registry: Arc<RouteRegistry>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<RouteRegistry>, config: HealthConfig) -> Self {
        Self { registry, config }
    }

    /// Run a single probe cycle over a snapshot of the registry
    pub async fn run_cycle(&self) -> CycleReport {
        let targets: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|descriptor| !descriptor.tunnel)
            .collect();

        let timeout = self.config.probe_timeout;
        let outcomes = join_all(targets.iter().map(|descriptor| async move {
            let outcome = probe(&descriptor.address, timeout).await;
            (descriptor, outcome)
        }))
        .await;

        let mut report = CycleReport {
            probed: outcomes.len(),
            ..Default::default()
        };

        for (descriptor, outcome) in outcomes {
            match self
                .registry
                .record_probe(&descriptor.path, &descriptor.address, outcome)
            {
                ProbeVerdict::Suspect => {
                    warn!(
                        path = %descriptor.path,
                        address = %descriptor.address,
                        "Backend refused health probe"
                    );
                    report.suspect.push(descriptor.path.clone());
                }
                ProbeVerdict::Evicted => {
                    warn!(
                        path = %descriptor.path,
                        address = %descriptor.address,
                        "Backend refused twice, removing route"
                    );
                    report.evicted.push(descriptor.path.clone());
                }
                ProbeVerdict::Healthy | ProbeVerdict::Gone => {}
            }
        }

        debug!(
            probed = report.probed,
            evicted = report.evicted.len(),
            "Health cycle complete"
        );
        report
    }

    /// Probe on a fixed interval until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Health monitor started"
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        debug!("Health monitor stopped");
    }
}
