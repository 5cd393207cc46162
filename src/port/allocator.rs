//! Allocation engine: turns "ports for services X, Y, Z" into a conflict-free
//! set of leases recorded in the shared table.
//!
//! # Concurrency model
//!
//! Uniqueness is enforced by the on-disk table under the cross-process lock,
//! not by anything in memory. The per-instance cache mirrors this
//! environment's leases for cheap lookups and is never consulted when deciding
//! whether a port is free.
//!
//! The probe that approves a port is advisory. Between the probe and the
//! consumer's own `bind()` another process can still take the port; reuse
//! re-probes the lease, and consumers should retry their bind.

use super::preference::ServicePortPreference;
use super::prober::{PortProbe, TcpProber};
use super::range::{PortRange, RangeTier};
use super::store::{AllocationStore, AllocationTable, PortAllocation};
use crate::config::Config;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one allocate call.
///
/// On partial failure `ports` still lists what was obtained, `failed_services`
/// lists the rest, and `retry_after` suggests when to try again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRequestResult {
    pub success: bool,
    pub environment_id: String,
    pub ports: BTreeMap<String, u16>,
    pub failed_services: Vec<String>,
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_secs")]
    pub retry_after: Option<Duration>,
    /// Leases created (as opposed to reused) by this call.
    pub new_leases: usize,
}

fn serialize_secs<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

impl AllocationRequestResult {
    fn empty(environment_id: &str) -> Self {
        Self {
            success: true,
            environment_id: environment_id.to_string(),
            ports: BTreeMap::new(),
            failed_services: Vec::new(),
            error: None,
            retry_after: None,
            new_leases: 0,
        }
    }

    fn from_error(
        environment_id: &str,
        services: &[String],
        error: &Error,
        retry_after: Duration,
    ) -> Self {
        Self {
            success: false,
            environment_id: environment_id.to_string(),
            ports: BTreeMap::new(),
            failed_services: services.to_vec(),
            error: Some(error.to_string()),
            retry_after: error.is_retryable().then_some(retry_after),
            new_leases: 0,
        }
    }

    pub fn port(&self, service: &str) -> Option<u16> {
        self.ports.get(service).copied()
    }
}

/// Per-caller allocator bound to one environment id.
///
/// Construct one per process or test run; several instances may share a
/// state directory, in which case they coordinate through the table lock.
pub struct PortAllocator {
    pub(super) environment_id: String,
    pub(super) owner_test_id: Option<String>,
    pub(super) store: AllocationStore,
    pub(super) prober: Arc<dyn PortProbe>,
    pub(super) host: String,
    pub(super) config: Config,
    default_range: PortRange,
    preferences: HashMap<String, ServicePortPreference>,
    retry_after: Duration,
    /// Mirror of this environment's leases (service -> port). Not authoritative.
    pub(super) cache: Mutex<BTreeMap<String, u16>>,
}

impl PortAllocator {
    /// Build an allocator from a validated config.
    ///
    /// Invalid configuration is returned as an error here rather than at
    /// allocation time.
    pub fn new(environment_id: impl Into<String>, config: &Config) -> Result<Self> {
        let environment_id = environment_id.into();
        if environment_id.trim().is_empty() {
            return Err(Error::Validation(
                "environment id must not be empty".to_string(),
            ));
        }
        config.validate()?;

        let store = AllocationStore::with_lock_timeout(config.state_dir(), config.lock_timeout()?);
        let prober: Arc<dyn PortProbe> = Arc::new(TcpProber::new(config.probe_timeout()?));
        let preferences = config
            .preferences()
            .into_iter()
            .map(|p| (p.service_name.clone(), p))
            .collect();

        let allocator = Self {
            environment_id,
            owner_test_id: None,
            store,
            prober,
            host: config.probe_host().to_string(),
            default_range: config.range(config.default_tier())?,
            preferences,
            retry_after: config.retry_after()?,
            config: config.clone(),
            cache: Mutex::new(BTreeMap::new()),
        };

        if let Err(e) = allocator.refresh_cache() {
            warn!(
                "Could not load existing leases for '{}': {}",
                allocator.environment_id, e
            );
        }

        Ok(allocator)
    }

    /// Replace the availability probe.
    pub fn with_prober(mut self, prober: Arc<dyn PortProbe>) -> Self {
        self.prober = prober;
        self
    }

    /// Correlation id stamped on every lease this allocator creates.
    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.owner_test_id = Some(test_id.into());
        self
    }

    /// Range used by [`allocate_ports`](Self::allocate_ports).
    pub fn with_default_range(mut self, range: PortRange) -> Result<Self> {
        range.validate()?;
        self.default_range = range;
        Ok(self)
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    pub fn default_range(&self) -> PortRange {
        self.default_range
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    /// Allocate ports for `services` in the default range.
    ///
    /// Only configuration mistakes are returned as `Err`. Lock timeouts,
    /// exhaustion and I/O failures come back as an unsuccessful result.
    pub fn allocate_ports<S: AsRef<str>>(
        &self,
        services: &[S],
        prefer_sequential: bool,
    ) -> Result<AllocationRequestResult> {
        self.allocate_in_range(services, self.default_range, prefer_sequential)
    }

    /// Allocate ports for `services` in a configured tier.
    pub fn allocate_in_tier<S: AsRef<str>>(
        &self,
        services: &[S],
        tier: RangeTier,
        prefer_sequential: bool,
    ) -> Result<AllocationRequestResult> {
        let range = self.config.range(tier)?;
        self.allocate_in_range(services, range, prefer_sequential)
    }

    /// Allocate ports for `services` inside `range`.
    pub fn allocate_in_range<S: AsRef<str>>(
        &self,
        services: &[S],
        range: PortRange,
        prefer_sequential: bool,
    ) -> Result<AllocationRequestResult> {
        range.validate()?;

        let mut seen = HashSet::new();
        let services: Vec<String> = services
            .iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();

        if services.is_empty() {
            return Ok(AllocationRequestResult::empty(&self.environment_id));
        }

        let lock = match self.store.lock() {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Allocation for '{}' failed: {}", self.environment_id, e);
                return Ok(AllocationRequestResult::from_error(
                    &self.environment_id,
                    &services,
                    &e,
                    self.retry_after,
                ));
            }
        };

        let mut table = match self.store.load() {
            Ok(table) => table,
            Err(e) => {
                return Ok(AllocationRequestResult::from_error(
                    &self.environment_id,
                    &services,
                    &e,
                    self.retry_after,
                ))
            }
        };

        let mut outcome = self.assign(&mut table, &services, range, prefer_sequential);

        if outcome.dirty {
            if let Err(e) = self.store.save(&table, &lock) {
                warn!(
                    "Failed to persist allocations for '{}': {}",
                    self.environment_id, e
                );
                drop(lock);
                // Nothing was persisted: new leases must not be handed out.
                let reused = std::mem::take(&mut outcome.reused);
                let mut result = AllocationRequestResult::from_error(
                    &self.environment_id,
                    &services,
                    &e,
                    self.retry_after,
                );
                result.failed_services.retain(|s| !reused.contains_key(s));
                result.ports = reused;
                self.sync_cache(&result.ports, &outcome.dropped);
                return Ok(result);
            }
        }
        drop(lock);

        let new_leases = outcome.created.len();
        let mut ports = std::mem::take(&mut outcome.reused);
        ports.extend(outcome.created);
        self.sync_cache(&ports, &outcome.dropped);

        let success = outcome.failed.is_empty();
        let result = AllocationRequestResult {
            success,
            environment_id: self.environment_id.clone(),
            error: (!success).then(|| {
                Error::RangeExhausted {
                    service: outcome.failed.join(", "),
                    range: range.to_string(),
                }
                .to_string()
            }),
            retry_after: (!success).then_some(self.retry_after),
            failed_services: outcome.failed,
            ports,
            new_leases,
        };

        if result.success {
            info!(
                "Allocated {} port(s) for '{}' ({} new)",
                result.ports.len(),
                self.environment_id,
                new_leases
            );
        }

        Ok(result)
    }

    /// Core assignment over a loaded table. Mutates `table` in place.
    fn assign(
        &self,
        table: &mut AllocationTable,
        services: &[String],
        range: PortRange,
        prefer_sequential: bool,
    ) -> Assignment {
        let mut outcome = Assignment::default();
        let mut pending = Vec::new();

        // Existing leases: reuse if still in range and still bindable.
        for service in services {
            let Some(existing) = table.get(&self.environment_id, service).cloned() else {
                pending.push(service.clone());
                continue;
            };

            if !range.contains(existing.port) {
                debug!(
                    "Lease {}/{} on port {} is outside {}, reallocating",
                    self.environment_id, service, existing.port, range
                );
            } else if self.prober.is_available(existing.port, &self.host) {
                outcome.reused.insert(service.clone(), existing.port);
                continue;
            } else {
                debug!(
                    "Lease {}/{} on port {} is no longer bindable, reallocating",
                    self.environment_id, service, existing.port
                );
            }

            table.remove(&self.environment_id, service);
            outcome.dropped.push(service.clone());
            outcome.dirty = true;
            pending.push(service.clone());
        }

        let mut taken = table.claimed_ports();

        for service in pending {
            match self.find_port(&service, range, &taken, prefer_sequential) {
                Some(port) => {
                    taken.insert(port);
                    let lease = PortAllocation::new(&self.environment_id, &service, port)
                        .with_test_id(self.owner_test_id.clone());
                    table.insert(lease);
                    outcome.created.insert(service, port);
                    outcome.dirty = true;
                }
                None => {
                    warn!(
                        "No free port for {}/{} in {}",
                        self.environment_id, service, range
                    );
                    outcome.failed.push(service);
                }
            }
        }

        outcome
    }

    /// Preferred port first, then a search of the rest of the range.
    fn find_port(
        &self,
        service: &str,
        range: PortRange,
        taken: &HashSet<u16>,
        prefer_sequential: bool,
    ) -> Option<u16> {
        let preferred = self
            .preferences
            .get(service)
            .and_then(|p| p.preferred_port(&range))
            .unwrap_or(range.start);

        if !taken.contains(&preferred) && self.prober.is_available(preferred, &self.host) {
            debug!("Using preferred port {} for {}", preferred, service);
            return Some(preferred);
        }

        let candidates: Vec<u16> = if prefer_sequential {
            let after = preferred.checked_add(1).map(|p| p..=range.end);
            after
                .into_iter()
                .flatten()
                .chain(range.start..preferred)
                .collect()
        } else {
            let mut all: Vec<u16> = range.ports().filter(|p| *p != preferred).collect();
            all.shuffle(&mut rand::thread_rng());
            all
        };

        candidates
            .into_iter()
            .filter(|port| !taken.contains(port))
            .find(|port| self.prober.is_available(*port, &self.host))
    }

    fn sync_cache(&self, ports: &BTreeMap<String, u16>, dropped: &[String]) {
        let mut cache = self.cache.lock();
        for service in dropped {
            cache.remove(service);
        }
        for (service, port) in ports {
            cache.insert(service.clone(), *port);
        }
    }
}

#[derive(Default)]
struct Assignment {
    reused: BTreeMap<String, u16>,
    created: BTreeMap<String, u16>,
    failed: Vec<String>,
    /// Stale or out-of-range leases removed from the table.
    dropped: Vec<String>,
    dirty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that treats a fixed set of ports as free.
    struct FreeSet {
        free: Mutex<HashSet<u16>>,
        probes: AtomicUsize,
    }

    impl FreeSet {
        fn new(ports: impl IntoIterator<Item = u16>) -> Arc<Self> {
            Arc::new(Self {
                free: Mutex::new(ports.into_iter().collect()),
                probes: AtomicUsize::new(0),
            })
        }
    }

    impl PortProbe for FreeSet {
        fn is_available(&self, port: u16, _host: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.free.lock().contains(&port)
        }
    }

    fn allocator(dir: &tempfile::TempDir, env: &str, probe: Arc<FreeSet>) -> PortAllocator {
        let config = Config {
            state_dir: Some(dir.path().to_path_buf()),
            lock_timeout: Some("2s".to_string()),
            ..Config::default()
        };
        PortAllocator::new(env, &config).unwrap().with_prober(probe)
    }

    #[test]
    fn empty_request_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir, "env-a", FreeSet::new(30000..=30999));

        let result = alloc.allocate_ports::<&str>(&[], false).unwrap();
        assert!(result.success);
        assert!(result.ports.is_empty());
        assert!(!alloc.store().table_path().exists());
    }

    #[test]
    fn preferred_offsets_are_used_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir, "env-a", FreeSet::new(30000..=30999));

        let result = alloc
            .allocate_ports(&["backend", "postgres", "unknown-svc"], false)
            .unwrap();
        assert!(result.success);
        assert_eq!(result.port("backend"), Some(30000));
        assert_eq!(result.port("postgres"), Some(30010));
        // unknown service prefers range start, which backend already took
        let other = result.port("unknown-svc").unwrap();
        assert!((30001..=30999).contains(&other));
        assert_ne!(other, 30010);
    }

    #[test]
    fn sequential_search_walks_upward_from_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FreeSet::new([30003, 30004, 30005]);
        let alloc = allocator(&dir, "env-a", probe);

        let result = alloc.allocate_ports(&["backend", "auth"], true).unwrap();
        assert!(result.success);
        assert_eq!(result.port("backend"), Some(30003));
        assert_eq!(result.port("auth"), Some(30004));
    }

    #[test]
    fn duplicate_service_names_are_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir, "env-a", FreeSet::new(30000..=30999));

        let result = alloc.allocate_ports(&["redis", "redis", " redis "], false).unwrap();
        assert_eq!(result.ports.len(), 1);
        assert_eq!(result.new_leases, 1);
    }

    #[test]
    fn exhausted_range_returns_partial_result() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir, "env-a", FreeSet::new([30500]));

        let result = alloc.allocate_ports(&["backend", "auth"], false).unwrap();
        assert!(!result.success);
        assert_eq!(result.ports.len(), 1);
        assert_eq!(result.failed_services.len(), 1);
        assert_eq!(result.retry_after, Some(Duration::from_secs(5)));
        assert!(result.error.unwrap().contains("No free port"));

        // the obtained lease is persisted
        let table = alloc.store().snapshot().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().next().unwrap().port, 30500);
    }

    #[test]
    fn stale_lease_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FreeSet::new(30000..=30999);
        let alloc = allocator(&dir, "env-a", Arc::clone(&probe));

        let first = alloc.allocate_ports(&["backend"], false).unwrap();
        assert_eq!(first.port("backend"), Some(30000));

        // someone else binds 30000
        probe.free.lock().remove(&30000);

        let second = alloc.allocate_ports(&["backend"], false).unwrap();
        assert!(second.success);
        assert_ne!(second.port("backend"), Some(30000));
        assert_eq!(second.new_leases, 1);
        assert_eq!(alloc.store().snapshot().unwrap().len(), 1);
    }

    #[test]
    fn lease_outside_requested_range_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir, "env-a", FreeSet::new((30000..=30999).chain(32000..=32999)));

        let shared = alloc.allocate_ports(&["backend"], false).unwrap();
        assert_eq!(shared.port("backend"), Some(30000));

        let ci = alloc
            .allocate_in_tier(&["backend"], RangeTier::Ci, false)
            .unwrap();
        assert_eq!(ci.port("backend"), Some(32000));
        assert_eq!(alloc.store().snapshot().unwrap().len(), 1);
    }

    #[test]
    fn invalid_range_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir, "env-a", FreeSet::new(Vec::new()));
        let range = PortRange {
            start: 500,
            end: 100,
            tier: None,
        };
        assert!(alloc.allocate_in_range(&["backend"], range, false).is_err());
    }

    #[test]
    fn lock_timeout_becomes_retryable_result() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: Some(dir.path().to_path_buf()),
            lock_timeout: Some("100ms".to_string()),
            ..Config::default()
        };
        let alloc = PortAllocator::new("env-a", &config)
            .unwrap()
            .with_prober(FreeSet::new(30000..=30999));

        let _held = alloc.store().lock().unwrap();
        let result = alloc.allocate_ports(&["backend"], false).unwrap();
        assert!(!result.success);
        assert_eq!(result.failed_services, vec!["backend".to_string()]);
        assert_eq!(result.retry_after, Some(Duration::from_secs(5)));
    }

    #[test]
    fn empty_environment_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        assert!(PortAllocator::new("  ", &config).is_err());
    }
}
