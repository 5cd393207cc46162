//! Reclaims leases left behind by crashed or abandoned processes.
//!
//! A lease is only considered once it is older than the age threshold. It is
//! then kept if it is locked, or if its owner is another live process and the
//! port is still bound. Everything else is removed.

use super::prober::PortProbe;
use super::process::is_process_alive;
use super::store::{AllocationStore, PortAllocation};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Why a lease was kept or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapDecision {
    /// Younger than the threshold.
    KeepFresh,
    /// Explicitly locked.
    KeepLocked,
    /// Owner is alive and the port is still bound.
    KeepInUse,
    /// Old and the owning process is gone.
    RemoveOwnerGone,
    /// Old and nothing holds the port (or no other owner to check).
    RemoveExpired,
}

impl ReapDecision {
    pub fn removes(&self) -> bool {
        matches!(
            self,
            ReapDecision::RemoveOwnerGone | ReapDecision::RemoveExpired
        )
    }
}

/// Convert a fractional hour threshold into a chrono duration.
pub fn max_age_from_hours(hours: f64) -> Result<chrono::Duration> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(Error::Validation(format!(
            "max age must be a non-negative number of hours, got {}",
            hours
        )));
    }
    let millis = (hours * 3_600_000.0).round();
    if millis > i64::MAX as f64 {
        return Err(Error::Validation(format!("max age {}h is too large", hours)));
    }
    Ok(chrono::Duration::milliseconds(millis as i64))
}

pub struct Reaper<'a> {
    store: &'a AllocationStore,
    prober: &'a dyn PortProbe,
    host: &'a str,
    is_alive: fn(u32) -> bool,
    current_pid: u32,
}

impl<'a> Reaper<'a> {
    pub fn new(store: &'a AllocationStore, prober: &'a dyn PortProbe, host: &'a str) -> Self {
        Self {
            store,
            prober,
            host,
            is_alive: is_process_alive,
            current_pid: std::process::id(),
        }
    }

    /// Override the process liveness check.
    pub fn with_liveness(mut self, is_alive: fn(u32) -> bool) -> Self {
        self.is_alive = is_alive;
        self
    }

    pub fn decide(
        &self,
        allocation: &PortAllocation,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> ReapDecision {
        if allocation.age(now) <= max_age {
            return ReapDecision::KeepFresh;
        }
        if allocation.is_locked {
            return ReapDecision::KeepLocked;
        }

        match allocation.owner_process_id {
            Some(pid) if pid != self.current_pid => {
                if !(self.is_alive)(pid) {
                    ReapDecision::RemoveOwnerGone
                } else if !self.prober.is_available(allocation.port, self.host) {
                    ReapDecision::KeepInUse
                } else {
                    ReapDecision::RemoveExpired
                }
            }
            _ => ReapDecision::RemoveExpired,
        }
    }

    /// Remove expired leases under the table lock. Returns how many went.
    pub fn cleanup_expired(&self, max_age: chrono::Duration) -> Result<usize> {
        let now = Utc::now();

        let removed = self.store.modify(|table| {
            let before = table.len();
            table.retain(|allocation| {
                let decision = self.decide(allocation, now, max_age);
                if decision.removes() {
                    info!(
                        "Reclaiming port {} from {}/{} ({:?})",
                        allocation.port,
                        allocation.environment_id,
                        allocation.service_name,
                        decision
                    );
                } else if decision != ReapDecision::KeepFresh {
                    debug!(
                        "Keeping expired lease {}/{} on port {} ({:?})",
                        allocation.environment_id,
                        allocation.service_name,
                        allocation.port,
                        decision
                    );
                }
                !decision.removes()
            });
            before - table.len()
        })?;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct AllFree;

    impl PortProbe for AllFree {
        fn is_available(&self, _port: u16, _host: &str) -> bool {
            true
        }
    }

    struct AllBound;

    impl PortProbe for AllBound {
        fn is_available(&self, _port: u16, _host: &str) -> bool {
            false
        }
    }

    fn aged(env: &str, service: &str, port: u16, hours: i64, pid: Option<u32>) -> PortAllocation {
        let mut allocation = PortAllocation::new(env, service, port);
        allocation.allocated_at = Utc::now() - chrono::Duration::hours(hours);
        allocation.owner_process_id = pid;
        allocation
    }

    #[test]
    fn max_age_conversion() {
        assert_eq!(
            max_age_from_hours(24.0).unwrap(),
            chrono::Duration::hours(24)
        );
        assert_eq!(
            max_age_from_hours(0.5).unwrap(),
            chrono::Duration::minutes(30)
        );
        assert!(max_age_from_hours(-1.0).is_err());
        assert!(max_age_from_hours(f64::NAN).is_err());
    }

    #[test]
    fn decisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = AllocationStore::new(dir.path());
        let max_age = chrono::Duration::hours(24);
        let now = Utc::now();
        let other_pid = std::process::id() + 1;

        let bound = Reaper::new(&store, &AllBound, "127.0.0.1").with_liveness(|_| true);
        let dead = Reaper::new(&store, &AllBound, "127.0.0.1").with_liveness(|_| false);
        let free = Reaper::new(&store, &AllFree, "127.0.0.1").with_liveness(|_| true);

        let fresh = aged("e", "s", 30000, 1, Some(other_pid));
        assert_eq!(bound.decide(&fresh, now, max_age), ReapDecision::KeepFresh);

        let mut locked = aged("e", "s", 30000, 48, None);
        locked.is_locked = true;
        assert_eq!(dead.decide(&locked, now, max_age), ReapDecision::KeepLocked);

        let held = aged("e", "s", 30000, 48, Some(other_pid));
        assert_eq!(bound.decide(&held, now, max_age), ReapDecision::KeepInUse);
        assert_eq!(dead.decide(&held, now, max_age), ReapDecision::RemoveOwnerGone);
        assert_eq!(free.decide(&held, now, max_age), ReapDecision::RemoveExpired);

        let ours = aged("e", "s", 30000, 48, Some(std::process::id()));
        assert_eq!(bound.decide(&ours, now, max_age), ReapDecision::RemoveExpired);

        let anonymous = aged("e", "s", 30000, 48, None);
        assert_eq!(bound.decide(&anonymous, now, max_age), ReapDecision::RemoveExpired);
    }

    #[test]
    fn cleanup_removes_only_reclaimable_leases() {
        let dir = tempfile::tempdir().unwrap();
        let store = AllocationStore::with_lock_timeout(dir.path(), Duration::from_secs(2));

        store
            .modify(|table| {
                table.insert(aged("env-a", "backend", 30000, 48, None));
                table.insert(aged("env-a", "auth", 30002, 1, None));
                let mut locked = aged("env-b", "postgres", 30010, 72, None);
                locked.is_locked = true;
                table.insert(locked);
            })
            .unwrap();

        let reaper = Reaper::new(&store, &AllFree, "127.0.0.1");
        let removed = reaper.cleanup_expired(chrono::Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);

        let table = store.snapshot().unwrap();
        assert!(table.get("env-a", "backend").is_none());
        assert!(table.get("env-a", "auth").is_some());
        assert!(table.get("env-b", "postgres").is_some());
    }
}
