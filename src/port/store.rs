//! Durable allocation table shared by every process on the host.
//!
//! On disk the table is JSON nested as `environment -> service -> record`,
//! which keeps it readable when debugging a stuck CI host. In memory it is a
//! flat map keyed by `(environment_id, service_name)`.
//!
//! All mutation goes through a read-modify-write cycle under [`ScopedLock`];
//! [`AllocationStore::save`] takes the guard by reference so a write without
//! the lock does not type-check.

use super::lock::{ScopedLock, DEFAULT_LOCK_TIMEOUT};
use crate::error::{validate_owner_pid, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const TABLE_FILE_NAME: &str = "allocations.json";
const LOCK_FILE_NAME: &str = "allocations.lock";

/// One active port lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub service_name: String,
    pub port: u16,
    pub environment_id: String,
    pub allocated_at: DateTime<Utc>,
    #[serde(default)]
    pub owner_test_id: Option<String>,
    #[serde(default)]
    pub owner_process_id: Option<u32>,
    #[serde(default)]
    pub is_locked: bool,
}

impl PortAllocation {
    /// New lease owned by the current process.
    pub fn new(
        environment_id: impl Into<String>,
        service_name: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            environment_id: environment_id.into(),
            allocated_at: Utc::now(),
            owner_test_id: None,
            owner_process_id: Some(std::process::id()),
            is_locked: false,
        }
    }

    pub fn with_test_id(mut self, test_id: Option<String>) -> Self {
        self.owner_test_id = test_id;
        self
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(&self.environment_id, &self.service_name)
    }

    /// Age of the lease relative to `now`. Future timestamps count as zero.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.allocated_at).max(chrono::Duration::zero())
    }
}

/// Composite `(environment_id, service_name)` key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationKey {
    pub environment_id: String,
    pub service_name: String,
}

impl AllocationKey {
    pub fn new(environment_id: &str, service_name: &str) -> Self {
        Self {
            environment_id: environment_id.to_string(),
            service_name: service_name.to_string(),
        }
    }
}

type NestedTable = BTreeMap<String, BTreeMap<String, PortAllocation>>;

/// In-memory view of the persisted allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationTable {
    entries: BTreeMap<AllocationKey, PortAllocation>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, environment_id: &str, service_name: &str) -> Option<&PortAllocation> {
        self.entries
            .get(&AllocationKey::new(environment_id, service_name))
    }

    pub fn get_mut(
        &mut self,
        environment_id: &str,
        service_name: &str,
    ) -> Option<&mut PortAllocation> {
        self.entries
            .get_mut(&AllocationKey::new(environment_id, service_name))
    }

    /// Insert or replace the lease for the record's key.
    pub fn insert(&mut self, allocation: PortAllocation) -> Option<PortAllocation> {
        self.entries.insert(allocation.key(), allocation)
    }

    pub fn remove(&mut self, environment_id: &str, service_name: &str) -> Option<PortAllocation> {
        self.entries
            .remove(&AllocationKey::new(environment_id, service_name))
    }

    /// Remove every lease belonging to `environment_id`.
    pub fn remove_environment(&mut self, environment_id: &str) -> Vec<PortAllocation> {
        let keys: Vec<AllocationKey> = self
            .entries
            .keys()
            .filter(|k| k.environment_id == environment_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    /// Keep only the leases for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&PortAllocation) -> bool) {
        self.entries.retain(|_, allocation| keep(allocation));
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortAllocation> {
        self.entries.values()
    }

    pub fn environment(&self, environment_id: &str) -> impl Iterator<Item = &PortAllocation> {
        let environment_id = environment_id.to_string();
        self.entries
            .values()
            .filter(move |a| a.environment_id == environment_id)
    }

    /// The lease currently holding `port`, if any.
    pub fn owner_of(&self, port: u16) -> Option<&PortAllocation> {
        self.entries.values().find(|a| a.port == port)
    }

    pub fn claimed_ports(&self) -> HashSet<u16> {
        self.entries.values().map(|a| a.port).collect()
    }

    fn to_nested(&self) -> NestedTable {
        let mut nested = NestedTable::new();
        for allocation in self.entries.values() {
            nested
                .entry(allocation.environment_id.clone())
                .or_default()
                .insert(allocation.service_name.clone(), allocation.clone());
        }
        nested
    }

    /// Build a table from the raw JSON document, dropping records that fail
    /// structural validation instead of failing the whole load.
    fn from_document(document: serde_json::Value) -> Self {
        let mut table = Self::new();

        let serde_json::Value::Object(environments) = document else {
            warn!("Allocation table is not a JSON object, treating it as empty");
            return table;
        };

        for (environment_id, services) in environments {
            let serde_json::Value::Object(services) = services else {
                warn!(
                    "Dropping environment '{}': expected an object of services",
                    environment_id
                );
                continue;
            };

            for (service_name, raw) in services {
                match validate_record(&environment_id, &service_name, raw) {
                    Ok(allocation) => {
                        if let Some(owner) = table.owner_of(allocation.port) {
                            warn!(
                                "Dropping duplicate lease on port {} for {}/{} (already held by {}/{})",
                                allocation.port,
                                environment_id,
                                service_name,
                                owner.environment_id,
                                owner.service_name
                            );
                            continue;
                        }
                        table.insert(allocation);
                    }
                    Err(reason) => warn!(
                        "Dropping invalid allocation record {}/{}: {}",
                        environment_id, service_name, reason
                    ),
                }
            }
        }

        table
    }
}

fn validate_record(
    environment_id: &str,
    service_name: &str,
    raw: serde_json::Value,
) -> std::result::Result<PortAllocation, String> {
    let allocation: PortAllocation = serde_json::from_value(raw).map_err(|e| e.to_string())?;

    if allocation.port == 0 {
        return Err("port 0 is not a valid lease".to_string());
    }
    if allocation.environment_id != environment_id {
        return Err(format!(
            "record names environment '{}' but is stored under '{}'",
            allocation.environment_id, environment_id
        ));
    }
    if allocation.service_name != service_name {
        return Err(format!(
            "record names service '{}' but is stored under '{}'",
            allocation.service_name, service_name
        ));
    }
    if let Some(pid) = allocation.owner_process_id {
        validate_owner_pid(pid).map_err(|e| e.to_string())?;
    }

    Ok(allocation)
}

/// File-backed allocation table plus its lock file.
#[derive(Debug, Clone)]
pub struct AllocationStore {
    state_dir: PathBuf,
    table_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl AllocationStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self::with_lock_timeout(state_dir, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(state_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let state_dir = state_dir.into();
        Self {
            table_path: state_dir.join(TABLE_FILE_NAME),
            lock_path: state_dir.join(LOCK_FILE_NAME),
            state_dir,
            lock_timeout,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Acquire the cross-process lock guarding the table.
    pub fn lock(&self) -> Result<ScopedLock> {
        ScopedLock::acquire(&self.lock_path, self.lock_timeout)
    }

    /// Read the persisted table.
    ///
    /// A missing file is an empty table. A file that is not valid JSON is
    /// also treated as empty (logged), favouring availability over history.
    pub fn load(&self) -> Result<AllocationTable> {
        let contents = match fs::read_to_string(&self.table_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AllocationTable::new())
            }
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to read allocation table '{}': {}",
                    self.table_path.display(),
                    e
                )))
            }
        };

        if contents.trim().is_empty() {
            return Ok(AllocationTable::new());
        }

        match serde_json::from_str::<serde_json::Value>(&contents) {
            Ok(document) => Ok(AllocationTable::from_document(document)),
            Err(e) => {
                warn!(
                    "Allocation table {:?} is corrupt ({}), starting from an empty table",
                    self.table_path, e
                );
                Ok(AllocationTable::new())
            }
        }
    }

    /// Atomically replace the persisted table. The caller must hold the lock
    /// for the whole load/mutate/save cycle.
    pub fn save(&self, table: &AllocationTable, lock: &ScopedLock) -> Result<()> {
        debug_assert_eq!(lock.path(), self.lock_path.as_path());

        fs::create_dir_all(&self.state_dir).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create state directory '{}': {}",
                self.state_dir.display(),
                e
            ))
        })?;

        let contents = serde_json::to_string_pretty(&table.to_nested())?;
        atomic_write(&self.table_path, &contents)?;
        debug!(
            "Saved {} allocation(s) to {:?}",
            table.len(),
            self.table_path
        );
        Ok(())
    }

    /// Run `f` against the table under the lock, saving only if it changed.
    pub fn modify<R>(&self, f: impl FnOnce(&mut AllocationTable) -> R) -> Result<R> {
        let lock = self.lock()?;
        let mut table = self.load()?;
        let before = table.clone();

        let result = f(&mut table);

        if table != before {
            self.save(&table, &lock)?;
        }
        Ok(result)
    }

    /// Consistent snapshot of the table, read under the lock.
    pub fn snapshot(&self) -> Result<AllocationTable> {
        let _lock = self.lock()?;
        self.load()
    }
}

/// Atomic file write using write-then-rename pattern
fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    let mut file = fs::File::create(&temp_path)
        .map_err(|e| Error::Filesystem(format!("Failed to create temp file: {}", e)))?;

    file.write_all(contents.as_bytes())
        .map_err(|e| Error::Filesystem(format!("Failed to write temp file: {}", e)))?;

    // Ensure data is written to disk before rename
    file.sync_all()
        .map_err(|e| Error::Filesystem(format!("Failed to sync temp file: {}", e)))?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::Filesystem(format!(
            "Failed to rename temp file: {}",
            e
        )));
    }

    Ok(())
}
