//! Configuration file polling

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use burrow_control::ShutdownSignal;
use burrow_router::{ReplaceSummary, RouteRegistry};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ServerRecord};

/// What a single poll did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// File untouched, or touched with an identical server list
    Unchanged,
    /// New server list applied
    Applied(ReplaceSummary),
    /// File unreadable or invalid; current routes kept
    Skipped,
    /// `shutdown` set; graceful shutdown started
    Shutdown,
    /// `forceShutdown` set; forced shutdown started
    ForceShutdown,
}

/// Re-reads the config file when its modification time advances
pub struct ConfigWatcher {
    path: PathBuf,
    registry: Arc<RouteRegistry>,
    shutdown: ShutdownSignal,
    interval: Duration,
    last_modified: Option<SystemTime>,
    last_servers: Vec<ServerRecord>,
}

impl ConfigWatcher {
    /// `initial` is the configuration already applied at startup
    pub fn new(
        path: impl Into<PathBuf>,
        registry: Arc<RouteRegistry>,
        shutdown: ShutdownSignal,
        initial: &ProxyConfig,
    ) -> Self {
        let path = path.into();
        let last_modified = std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .ok();
        Self {
            path,
            registry,
            shutdown,
            interval: initial.poll_interval(),
            last_modified,
            last_servers: initial.servers.clone(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Check the file once and apply any change
    pub async fn poll_once(&mut self) -> PollOutcome {
        let modified = match tokio::fs::metadata(&self.path)
            .await
            .and_then(|meta| meta.modified())
        {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Cannot stat config file");
                return PollOutcome::Skipped;
            }
        };

        if self.last_modified.is_some_and(|last| modified <= last) {
            return PollOutcome::Unchanged;
        }
        self.last_modified = Some(modified);

        let config = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => ProxyConfig::parse(&json, &self.path),
            Err(source) => Err(crate::config::ConfigError::Read {
                path: self.path.clone(),
                source,
            }),
        };
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Ignoring config update");
                return PollOutcome::Skipped;
            }
        };

        if config.force_shutdown {
            self.shutdown.force();
            return PollOutcome::ForceShutdown;
        }
        if config.shutdown {
            self.shutdown.shutdown(None);
            return PollOutcome::Shutdown;
        }

        if config.servers == self.last_servers {
            debug!(path = ?self.path, "Config touched, server list unchanged");
            return PollOutcome::Unchanged;
        }

        let summary = self.registry.replace_static(config.routes());
        info!(
            inserted = summary.inserted,
            removed = summary.removed,
            skipped = summary.skipped,
            "Applied config update"
        );
        self.last_servers = config.servers;
        PollOutcome::Applied(summary)
    }

    /// Poll until shutdown begins
    pub async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.stopped() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        PollOutcome::Shutdown | PollOutcome::ForceShutdown => break,
                        _ => {}
                    }
                }
            }
        }

        debug!("Config watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        registry: Arc<RouteRegistry>,
        shutdown: ShutdownSignal,
    }

    impl Fixture {
        fn new(json: &str) -> (Self, ConfigWatcher) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("config.json");
            fs::write(&path, json).unwrap();

            let registry = Arc::new(RouteRegistry::new());
            let shutdown = ShutdownSignal::new();
            let initial = ProxyConfig::load(&path).unwrap();
            registry.replace_static(initial.routes());

            let watcher = ConfigWatcher::new(&path, registry.clone(), shutdown.clone(), &initial);
            (
                Self {
                    _dir: dir,
                    path,
                    registry,
                    shutdown,
                },
                watcher,
            )
        }

        /// Rewrite the file and push its mtime forward
        fn rewrite(&self, json: &str, bump_secs: u64) {
            fs::write(&self.path, json).unwrap();
            let file = File::options().write(true).open(&self.path).unwrap();
            file.set_modified(SystemTime::now() + Duration::from_secs(bump_secs))
                .unwrap();
        }
    }

    const INITIAL: &str = r#"{"servers": [{"name": "svc1", "addr": "127.0.0.1:9001"}]}"#;

    #[tokio::test]
    async fn test_untouched_file() {
        let (_fixture, mut watcher) = Fixture::new(INITIAL);
        assert_eq!(watcher.poll_once().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_applies_changed_servers() {
        let (fixture, mut watcher) = Fixture::new(INITIAL);
        assert!(fixture.registry.contains("/svc1"));

        fixture.rewrite(
            r#"{"servers": [{"name": "svc2", "addr": "127.0.0.1:9002"}]}"#,
            10,
        );
        match watcher.poll_once().await {
            PollOutcome::Applied(summary) => {
                assert_eq!(summary.inserted, 1);
                assert_eq!(summary.removed, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!fixture.registry.contains("/svc1"));
        assert!(fixture.registry.contains("/svc2"));

        // same servers, newer mtime
        fixture.rewrite(
            r#"{"servers": [{"name": "svc2", "addr": "127.0.0.1:9002"}], "configPollSecs": 5}"#,
            20,
        );
        assert_eq!(watcher.poll_once().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_ignores_unparseable_update() {
        let (fixture, mut watcher) = Fixture::new(INITIAL);

        fixture.rewrite("{ this is not json", 10);
        assert_eq!(watcher.poll_once().await, PollOutcome::Skipped);
        assert!(fixture.registry.contains("/svc1"));
        assert!(!fixture.shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_flags() {
        let (fixture, mut watcher) = Fixture::new(INITIAL);
        fixture.rewrite(r#"{"shutdown": true}"#, 10);
        assert_eq!(watcher.poll_once().await, PollOutcome::Shutdown);
        assert!(fixture.shutdown.is_shutting_down());
        assert!(!fixture.shutdown.is_forced());

        let (fixture, mut watcher) = Fixture::new(INITIAL);
        fixture.rewrite(r#"{"forceShutdown": true}"#, 10);
        assert_eq!(watcher.poll_once().await, PollOutcome::ForceShutdown);
        assert!(fixture.shutdown.is_forced());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_flag() {
        let (fixture, watcher) = Fixture::new(INITIAL);
        let watcher = watcher.with_interval(Duration::from_millis(20));

        let handle = tokio::spawn(watcher.run());
        fixture.rewrite(r#"{"shutdown": true}"#, 10);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(fixture.shutdown.is_shutting_down());
    }
}
