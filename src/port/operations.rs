//! Convenience operations on a [`PortAllocator`]: release, lock/unlock,
//! expiry cleanup, queries and async wrappers.
//!
//! Every mutation here goes through [`AllocationStore::modify`], so it runs
//! under the same cross-process lock as allocation.
//!
//! [`AllocationStore::modify`]: super::store::AllocationStore::modify

use super::allocator::{AllocationRequestResult, PortAllocator};
use super::reaper::{max_age_from_hours, Reaper};
use super::stats::AllocationStats;
use super::store::PortAllocation;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

impl PortAllocator {
    /// Release this environment's leases: all of them when `services` is
    /// `None`, otherwise only the named ones. Returns how many were removed.
    pub fn release_ports<S: AsRef<str>>(&self, services: Option<&[S]>) -> Result<usize> {
        let env = self.environment_id.clone();

        let released: Vec<PortAllocation> = self.store.modify(|table| match services {
            None => table.remove_environment(&env),
            Some(services) => services
                .iter()
                .filter_map(|s| table.remove(&env, s.as_ref()))
                .collect(),
        })?;

        let mut cache = self.cache.lock();
        for allocation in &released {
            cache.remove(&allocation.service_name);
        }
        drop(cache);

        if !released.is_empty() {
            info!(
                "Released {} port(s) for '{}': {}",
                released.len(),
                env,
                released
                    .iter()
                    .map(|a| format!("{}={}", a.service_name, a.port))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(released.len())
    }

    /// Protect a lease from the reaper. Returns false if there is no lease.
    pub fn lock_allocation(&self, service: &str) -> Result<bool> {
        self.set_locked(service, true)
    }

    /// Make a lease eligible for reaping again. Returns false if there is no
    /// lease.
    pub fn unlock_allocation(&self, service: &str) -> Result<bool> {
        self.set_locked(service, false)
    }

    fn set_locked(&self, service: &str, locked: bool) -> Result<bool> {
        let env = &self.environment_id;
        self.store.modify(|table| match table.get_mut(env, service) {
            Some(allocation) => {
                allocation.is_locked = locked;
                true
            }
            None => false,
        })
    }

    /// Remove leases older than `max_age_hours` whose owners are gone or no
    /// longer bind the port. Locked leases always survive.
    pub fn cleanup_expired_allocations(&self, max_age_hours: f64) -> Result<usize> {
        let max_age = max_age_from_hours(max_age_hours)?;
        let removed =
            Reaper::new(&self.store, self.prober.as_ref(), &self.host).cleanup_expired(max_age)?;
        if removed > 0 {
            self.refresh_cache()?;
        }
        Ok(removed)
    }

    /// Counts per environment, tier and service across the whole table.
    pub fn allocation_stats(&self) -> Result<AllocationStats> {
        let table = self.store.snapshot()?;
        Ok(AllocationStats::from_table(&table, &self.config))
    }

    /// The persisted lease for `service` in this environment.
    pub fn lookup(&self, service: &str) -> Result<Option<PortAllocation>> {
        let table = self.store.snapshot()?;
        Ok(table.get(&self.environment_id, service).cloned())
    }

    /// Like [`lookup`](Self::lookup) but an error when absent.
    pub fn require(&self, service: &str) -> Result<PortAllocation> {
        self.lookup(service)?
            .ok_or_else(|| Error::AllocationNotFound {
                environment_id: self.environment_id.clone(),
                service: service.to_string(),
            })
    }

    /// Every lease in the table, across all environments.
    pub fn list_allocations(&self) -> Result<Vec<PortAllocation>> {
        Ok(self.store.snapshot()?.iter().cloned().collect())
    }

    /// Reload this environment's leases from disk into the cache.
    pub fn refresh_cache(&self) -> Result<()> {
        let table = self.store.snapshot()?;
        let fresh: BTreeMap<String, u16> = table
            .environment(&self.environment_id)
            .map(|a| (a.service_name.clone(), a.port))
            .collect();
        *self.cache.lock() = fresh;
        Ok(())
    }

    /// Cached port for `service`. May be stale; use [`lookup`](Self::lookup)
    /// for the authoritative answer.
    pub fn cached_port(&self, service: &str) -> Option<u16> {
        self.cache.lock().get(service).copied()
    }

    pub fn cached_ports(&self) -> BTreeMap<String, u16> {
        self.cache.lock().clone()
    }

    /// Probe `port` on this allocator's host.
    pub fn is_port_available(&self, port: u16) -> bool {
        self.prober.is_available(port, &self.host)
    }

    /// [`allocate_ports`](Self::allocate_ports) on the blocking thread pool.
    pub async fn allocate_ports_async(
        self: Arc<Self>,
        services: Vec<String>,
        prefer_sequential: bool,
    ) -> Result<AllocationRequestResult> {
        tokio::task::spawn_blocking(move || self.allocate_ports(&services, prefer_sequential))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    /// [`release_ports`](Self::release_ports) on the blocking thread pool.
    pub async fn release_ports_async(self: Arc<Self>, services: Option<Vec<String>>) -> Result<usize> {
        tokio::task::spawn_blocking(move || self.release_ports(services.as_deref()))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    /// [`cleanup_expired_allocations`](Self::cleanup_expired_allocations) on
    /// the blocking thread pool.
    pub async fn cleanup_expired_async(self: Arc<Self>, max_age_hours: f64) -> Result<usize> {
        tokio::task::spawn_blocking(move || self.cleanup_expired_allocations(max_age_hours))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}
