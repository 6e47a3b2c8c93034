//! Route registry keyed by path
//!
//! Every key is `/` followed by exactly one non-empty segment. The registry is
//! the only shared routing state in the proxy; all mutation goes through
//! `DashMap`'s per-shard locking, so inserts for one path are atomic without a
//! global lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Where a route came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    /// Loaded from the configuration file
    Config,
    /// Added by a control-plane command
    Control,
    /// Claimed by an authenticated tunnel
    Handshake,
}

/// One registered backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Registry key, e.g. `/svc1`
    pub path: String,
    /// Display label; de-duplicated on insert
    pub name: Option<String>,
    /// Cosmetic flag, ignored by routing
    pub website: bool,
    /// Resolved through the tunnel broker instead of dialing `address`
    pub tunnel: bool,
    /// `host:port` to dial; empty for tunnels
    pub address: String,
    /// Dial the backend over TLS
    pub secure: bool,
    /// Refused health probes in a row
    pub consecutive_failures: u8,
    pub origin: RouteOrigin,
}

impl BackendDescriptor {
    pub fn dialed(path: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: None,
            website: false,
            tunnel: false,
            address: address.into(),
            secure: false,
            consecutive_failures: 0,
            origin: RouteOrigin::Control,
        }
    }

    pub fn tunnel(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: None,
            website: false,
            tunnel: true,
            address: String::new(),
            secure: false,
            consecutive_failures: 0,
            origin: RouteOrigin::Handshake,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_website(mut self, website: bool) -> Self {
        self.website = website;
        self
    }

    pub fn with_origin(mut self, origin: RouteOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Route registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route not found: {0}")]
    NotFound(String),

    #[error("Reserved path: {0:?}")]
    ReservedPath(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),
}

/// Result of [`RouteRegistry::insert_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The descriptor was stored. `evicted` holds older entries on other paths
    /// that carried the same display name.
    Inserted { evicted: Vec<BackendDescriptor> },
    /// The path was already taken; the registry is unchanged
    Existing(BackendDescriptor),
}

impl InsertOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }
}

/// Decision returned by a [`RouteRegistry::for_each`] visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Outcome of a single health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Refused,
}

/// Effect of applying a probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Failure count reset to zero
    Healthy,
    /// First refused probe
    Suspect,
    /// Second refused probe in a row; the route was removed
    Evicted,
    /// The route vanished or changed address while the probe ran
    Gone,
}

/// Counts from [`RouteRegistry::replace_static`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub removed: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Check that `segment` can be the single segment of a route path
pub fn validate_segment(segment: &str) -> Result<(), RouteError> {
    if segment.is_empty() || segment == "favicon.ico" {
        return Err(RouteError::ReservedPath(format!("/{}", segment)));
    }
    if segment
        .chars()
        .any(|c| matches!(c, '/' | '?' | '#') || c.is_whitespace())
    {
        return Err(RouteError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

/// Normalize a user-supplied path to `/segment`.
///
/// A missing leading slash is added and trailing slashes are dropped.
pub fn normalize_path(raw: &str) -> Result<String, RouteError> {
    let trimmed = raw.trim_end_matches('/');
    let segment = trimmed.strip_prefix('/').unwrap_or(trimmed);
    validate_segment(segment).map_err(|err| match err {
        RouteError::InvalidPath(_) => RouteError::InvalidPath(raw.to_string()),
        other => other,
    })?;
    Ok(format!("/{}", segment))
}

/// Registry of backends keyed by path
pub struct RouteRegistry {
    routes: Arc<DashMap<String, BackendDescriptor>>,
    /// Held across a named insert and its eviction pass
    naming: Mutex<()>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            naming: Mutex::new(()),
        }
    }

    /// Store `descriptor` unless its path is already taken.
    ///
    /// The path is normalized first. Never overwrites. If another path carries
    /// the same display name, that older entry is evicted.
    pub fn insert_if_absent(
        &self,
        mut descriptor: BackendDescriptor,
    ) -> Result<InsertOutcome, RouteError> {
        let path = normalize_path(&descriptor.path)?;
        descriptor.path = path.clone();

        // Named inserts are serialized so the newest same-name entry survives
        let _naming = descriptor
            .name
            .is_some()
            .then(|| self.naming.lock().unwrap_or_else(PoisonError::into_inner));

        match self.routes.entry(path.clone()) {
            Entry::Occupied(existing) => {
                trace!(path = %path, "Route already registered");
                return Ok(InsertOutcome::Existing(existing.get().clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
            }
        }

        debug!(
            path = %path,
            tunnel = descriptor.tunnel,
            address = %descriptor.address,
            "Registered route"
        );

        let evicted = match &descriptor.name {
            Some(name) => self.evict_name(name, &path),
            None => Vec::new(),
        };

        Ok(InsertOutcome::Inserted { evicted })
    }

    fn evict_name(&self, name: &str, keep: &str) -> Vec<BackendDescriptor> {
        let stale: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| entry.key() != keep && entry.name.as_deref() == Some(name))
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|path| {
                self.routes
                    .remove_if(&path, |_, d| d.name.as_deref() == Some(name))
                    .map(|(_, descriptor)| {
                        warn!(
                            name = %name,
                            path = %descriptor.path,
                            replacement = %keep,
                            "Evicted route with duplicate name"
                        );
                        descriptor
                    })
            })
            .collect()
    }

    /// Remove a route. Absent paths are not an error.
    pub fn remove(&self, path: &str) -> Option<BackendDescriptor> {
        let path = normalize_path(path).ok()?;
        let removed = self.routes.remove(&path).map(|(_, descriptor)| descriptor);
        if removed.is_some() {
            debug!(path = %path, "Removed route");
        }
        removed
    }

    /// Remove every dialed route pointing at `address`
    pub fn remove_by_address(&self, address: &str) -> Vec<BackendDescriptor> {
        let matching: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| !entry.tunnel && entry.address == address)
            .map(|entry| entry.key().clone())
            .collect();

        matching
            .into_iter()
            .filter_map(|path| {
                self.routes
                    .remove_if(&path, |_, d| !d.tunnel && d.address == address)
                    .map(|(_, descriptor)| descriptor)
            })
            .collect()
    }

    pub fn lookup(&self, path: &str) -> Result<BackendDescriptor, RouteError> {
        self.routes
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RouteError::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    /// Visit every route, removing those the visitor rejects.
    ///
    /// The visitor runs under the shard lock and must not call back into the
    /// registry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&BackendDescriptor) -> Visit,
    {
        self.routes
            .retain(|_, descriptor| visitor(descriptor) == Visit::Keep);
    }

    pub fn snapshot(&self) -> Vec<BackendDescriptor> {
        self.routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Replace the statically configured route set.
    ///
    /// Every dialed route is dropped. Tunnel routes survive unless the new set
    /// names their path. Invalid or duplicate records are skipped.
    pub fn replace_static(&self, records: Vec<BackendDescriptor>) -> ReplaceSummary {
        let mut summary = ReplaceSummary::default();

        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match normalize_path(&record.path) {
                Ok(path) => valid.push(BackendDescriptor { path, ..record }),
                Err(err) => {
                    warn!(path = %record.path, error = %err, "Skipping route record");
                    summary.skipped += 1;
                }
            }
        }

        let named: HashSet<&str> = valid.iter().map(|d| d.path.as_str()).collect();
        let before = self.routes.len();
        self.routes
            .retain(|path, descriptor| descriptor.tunnel && !named.contains(path.as_str()));
        summary.removed = before.saturating_sub(self.routes.len());

        for record in valid {
            let path = record.path.clone();
            match self.insert_if_absent(record) {
                Ok(InsertOutcome::Inserted { .. }) => summary.inserted += 1,
                Ok(InsertOutcome::Existing(_)) => {
                    warn!(path = %path, "Skipping duplicate route record");
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(path = %path, error = %err, "Skipping route record");
                    summary.skipped += 1;
                }
            }
        }

        debug!(
            removed = summary.removed,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "Replaced static routes"
        );
        summary
    }

    /// Apply one health-probe outcome for `path`.
    ///
    /// Only takes effect if the route is still a dialed backend at `address`.
    pub fn record_probe(&self, path: &str, address: &str, outcome: ProbeOutcome) -> ProbeVerdict {
        let verdict = {
            let Some(mut entry) = self.routes.get_mut(path) else {
                return ProbeVerdict::Gone;
            };
            if entry.tunnel || entry.address != address {
                return ProbeVerdict::Gone;
            }
            match outcome {
                ProbeOutcome::Reachable => {
                    entry.consecutive_failures = 0;
                    ProbeVerdict::Healthy
                }
                ProbeOutcome::Refused if entry.consecutive_failures >= 1 => ProbeVerdict::Evicted,
                ProbeOutcome::Refused => {
                    entry.consecutive_failures = 1;
                    ProbeVerdict::Suspect
                }
            }
        };

        if verdict == ProbeVerdict::Evicted {
            let removed = self
                .routes
                .remove_if(path, |_, d| !d.tunnel && d.address == address);
            if removed.is_none() {
                return ProbeVerdict::Gone;
            }
        }
        verdict
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("svc1").unwrap(), "/svc1");
        assert_eq!(normalize_path("/svc1/").unwrap(), "/svc1");
        assert_eq!(normalize_path("/svc1//").unwrap(), "/svc1");
        assert!(matches!(
            normalize_path("/"),
            Err(RouteError::ReservedPath(_))
        ));
        assert!(matches!(
            normalize_path("/favicon.ico"),
            Err(RouteError::ReservedPath(_))
        ));
        assert!(matches!(
            normalize_path("/a/b"),
            Err(RouteError::InvalidPath(_))
        ));
        assert!(matches!(
            normalize_path("/a b"),
            Err(RouteError::InvalidPath(_))
        ));
        assert!(matches!(
            normalize_path("/a?b"),
            Err(RouteError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_registry_insert_lookup() {
        let registry = RouteRegistry::new();
        let outcome = registry
            .insert_if_absent(BackendDescriptor::dialed("svc1", "127.0.0.1:9001"))
            .unwrap();
        assert!(outcome.inserted());

        let found = registry.lookup("/svc1").unwrap();
        assert_eq!(found.path, "/svc1");
        assert_eq!(found.address, "127.0.0.1:9001");
        assert!(!found.tunnel);
    }

    #[test]
    fn test_registry_never_overwrites() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/svc1", "127.0.0.1:9001"))
            .unwrap();

        let outcome = registry
            .insert_if_absent(BackendDescriptor::tunnel("/svc1"))
            .unwrap();
        match outcome {
            InsertOutcome::Existing(existing) => {
                assert_eq!(existing.address, "127.0.0.1:9001")
            }
            other => panic!("expected existing, got {:?}", other),
        }
        assert!(!registry.lookup("/svc1").unwrap().tunnel);
    }

    #[test]
    fn test_registry_not_found() {
        let registry = RouteRegistry::new();
        assert_eq!(
            registry.lookup("/nope"),
            Err(RouteError::NotFound("/nope".to_string()))
        );
    }

    #[test]
    fn test_registry_remove_is_idempotent() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/svc1", "127.0.0.1:9001"))
            .unwrap();

        assert!(registry.remove("/svc1").is_some());
        assert!(registry.remove("/svc1").is_none());
        assert!(registry.remove("/").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_by_address() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/a", "127.0.0.1:9001"))
            .unwrap();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/b", "127.0.0.1:9001"))
            .unwrap();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/c", "127.0.0.1:9002"))
            .unwrap();

        let removed = registry.remove_by_address("127.0.0.1:9001");
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("/c"));
    }

    #[test]
    fn test_duplicate_name_evicts_older_entry() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/old", "127.0.0.1:9001").with_name("svc"))
            .unwrap();

        let outcome = registry
            .insert_if_absent(BackendDescriptor::dialed("/new", "127.0.0.1:9002").with_name("svc"))
            .unwrap();

        match outcome {
            InsertOutcome::Inserted { evicted } => {
                assert_eq!(evicted.len(), 1);
                assert_eq!(evicted[0].path, "/old");
            }
            other => panic!("expected insert, got {:?}", other),
        }
        assert!(!registry.contains("/old"));
        assert!(registry.contains("/new"));
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let registry = Arc::new(RouteRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .insert_if_absent(BackendDescriptor::dialed(
                            "/race",
                            format!("127.0.0.1:{}", 9000 + i),
                        ))
                        .unwrap()
                        .inserted()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|inserted| *inserted)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_same_name_keeps_one() {
        for _ in 0..500 {
            let registry = Arc::new(RouteRegistry::new());
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let handles: Vec<_> = ["/a", "/b"]
                .into_iter()
                .map(|path| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry
                            .insert_if_absent(
                                BackendDescriptor::dialed(path, "127.0.0.1:9001").with_name("dup"),
                            )
                            .unwrap()
                            .inserted()
                    })
                })
                .collect();

            for handle in handles {
                assert!(handle.join().unwrap());
            }
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn test_for_each_can_remove() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/a", "127.0.0.1:9001"))
            .unwrap();
        registry
            .insert_if_absent(BackendDescriptor::tunnel("/b"))
            .unwrap();

        let mut visited = 0;
        registry.for_each(|descriptor| {
            visited += 1;
            if descriptor.tunnel {
                Visit::Remove
            } else {
                Visit::Keep
            }
        });

        assert_eq!(visited, 2);
        assert!(registry.contains("/a"));
        assert!(!registry.contains("/b"));
    }

    #[test]
    fn test_replace_static() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/old", "127.0.0.1:9001"))
            .unwrap();
        registry
            .insert_if_absent(BackendDescriptor::tunnel("/edge1"))
            .unwrap();
        registry
            .insert_if_absent(BackendDescriptor::tunnel("/edge2"))
            .unwrap();

        let summary = registry.replace_static(vec![
            BackendDescriptor::dialed("/svc1", "127.0.0.1:9002").with_origin(RouteOrigin::Config),
            BackendDescriptor::dialed("/edge2", "127.0.0.1:9003").with_origin(RouteOrigin::Config),
            BackendDescriptor::dialed("/", "127.0.0.1:9004").with_origin(RouteOrigin::Config),
        ]);

        assert_eq!(summary.removed, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.skipped, 1);
        assert!(!registry.contains("/old"));
        assert!(registry.lookup("/edge1").unwrap().tunnel);
        assert!(!registry.lookup("/edge2").unwrap().tunnel);
        assert_eq!(
            registry.lookup("/svc1").unwrap().origin,
            RouteOrigin::Config
        );
    }

    #[test]
    fn test_record_probe_evicts_after_two_refusals() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/svc1", "127.0.0.1:9001"))
            .unwrap();

        assert_eq!(
            registry.record_probe("/svc1", "127.0.0.1:9001", ProbeOutcome::Refused),
            ProbeVerdict::Suspect
        );
        assert_eq!(registry.lookup("/svc1").unwrap().consecutive_failures, 1);
        assert_eq!(
            registry.record_probe("/svc1", "127.0.0.1:9001", ProbeOutcome::Refused),
            ProbeVerdict::Evicted
        );
        assert!(!registry.contains("/svc1"));
    }

    #[test]
    fn test_record_probe_recovery_resets() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/svc1", "127.0.0.1:9001"))
            .unwrap();

        registry.record_probe("/svc1", "127.0.0.1:9001", ProbeOutcome::Refused);
        assert_eq!(
            registry.record_probe("/svc1", "127.0.0.1:9001", ProbeOutcome::Reachable),
            ProbeVerdict::Healthy
        );
        assert_eq!(
            registry.record_probe("/svc1", "127.0.0.1:9001", ProbeOutcome::Refused),
            ProbeVerdict::Suspect
        );
        assert!(registry.contains("/svc1"));
    }

    #[test]
    fn test_record_probe_ignores_readded_route() {
        let registry = RouteRegistry::new();
        registry
            .insert_if_absent(BackendDescriptor::dialed("/svc1", "127.0.0.1:9002"))
            .unwrap();

        assert_eq!(
            registry.record_probe("/svc1", "127.0.0.1:9001", ProbeOutcome::Refused),
            ProbeVerdict::Gone
        );
        assert_eq!(registry.lookup("/svc1").unwrap().consecutive_failures, 0);
        assert_eq!(
            registry.record_probe("/missing", "127.0.0.1:9001", ProbeOutcome::Refused),
            ProbeVerdict::Gone
        );
    }
}
