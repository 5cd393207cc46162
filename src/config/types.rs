use super::duration::duration_field;
use crate::error::{Error, Result};
use crate::port::lock::DEFAULT_LOCK_TIMEOUT;
use crate::port::preference::{default_preferences, ServicePortPreference};
use crate::port::prober::DEFAULT_PROBE_TIMEOUT;
use crate::port::range::{PortRange, RangeTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Overrides the default state directory.
pub const STATE_DIR_ENV: &str = "PORTLEASE_STATE_DIR";
/// Environment id used by the CLI when `--env-id` is not given.
pub const ENV_ID_ENV: &str = "PORTLEASE_ENV_ID";
/// Correlation id stamped on new leases as `owner_test_id`.
pub const TEST_ID_ENV: &str = "PORTLEASE_TEST_ID";

pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_AGE_HOURS: f64 = 24.0;
pub const DEFAULT_PROBE_HOST: &str = "127.0.0.1";

/// Top-level `portlease.yaml`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the allocation table and its lock file.
    pub state_dir: Option<PathBuf>,

    /// Set from the command line; wins over `$PORTLEASE_STATE_DIR`.
    #[serde(skip)]
    pub state_dir_override: Option<PathBuf>,

    /// How long to wait for the cross-process lock, e.g. `30s`.
    pub lock_timeout: Option<String>,

    /// Back-off hint returned with partial or failed allocations.
    pub retry_after: Option<String>,

    /// Bound on the connect half of a port probe.
    pub probe_timeout: Option<String>,

    pub probe_host: Option<String>,

    /// Default age threshold for `cleanup`.
    pub max_age_hours: Option<f64>,

    /// Tier used when a request does not name one.
    pub default_tier: Option<RangeTier>,

    /// Per-tier overrides of the built-in intervals.
    pub ranges: BTreeMap<RangeTier, RangeConfig>,

    /// Per-service overrides and additions to the built-in preferences.
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub base_port: u16,
    #[serde(default)]
    pub offset: u16,
}

impl Config {
    /// State directory: `state_dir_override`, then `$PORTLEASE_STATE_DIR`,
    /// then `state_dir`, then `<temp>/portlease` so that every process on the
    /// host agrees.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir_override {
            return dir.clone();
        }
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        self.state_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("portlease"))
    }

    pub fn lock_timeout(&self) -> Result<Duration> {
        duration_field(
            "lock_timeout",
            self.lock_timeout.as_deref(),
            DEFAULT_LOCK_TIMEOUT,
        )
    }

    pub fn retry_after(&self) -> Result<Duration> {
        duration_field(
            "retry_after",
            self.retry_after.as_deref(),
            DEFAULT_RETRY_AFTER,
        )
    }

    pub fn probe_timeout(&self) -> Result<Duration> {
        duration_field(
            "probe_timeout",
            self.probe_timeout.as_deref(),
            DEFAULT_PROBE_TIMEOUT,
        )
    }

    pub fn probe_host(&self) -> &str {
        self.probe_host.as_deref().unwrap_or(DEFAULT_PROBE_HOST)
    }

    pub fn max_age_hours(&self) -> f64 {
        self.max_age_hours.unwrap_or(DEFAULT_MAX_AGE_HOURS)
    }

    pub fn default_tier(&self) -> RangeTier {
        self.default_tier.unwrap_or(RangeTier::SharedTest)
    }

    /// Interval configured for `tier`, falling back to the built-in one.
    pub fn range(&self, tier: RangeTier) -> Result<PortRange> {
        let range = match self.ranges.get(&tier) {
            Some(cfg) => PortRange {
                start: cfg.start,
                end: cfg.end,
                tier: Some(tier),
            },
            None => tier.default_range(),
        };
        range.validate()?;
        Ok(range)
    }

    /// All tiers with their effective intervals.
    pub fn ranges(&self) -> Result<Vec<PortRange>> {
        RangeTier::ALL.iter().map(|tier| self.range(*tier)).collect()
    }

    /// Built-in preferences overlaid with the `services` section.
    pub fn preferences(&self) -> Vec<ServicePortPreference> {
        let mut merged: BTreeMap<String, ServicePortPreference> = default_preferences()
            .into_iter()
            .map(|p| (p.service_name.clone(), p))
            .collect();
        for (name, cfg) in &self.services {
            merged.insert(
                name.clone(),
                ServicePortPreference::new(name.clone(), cfg.base_port, cfg.offset),
            );
        }
        merged.into_values().collect()
    }

    /// Tier whose effective interval contains `port`.
    pub fn tier_of(&self, port: u16) -> Option<RangeTier> {
        RangeTier::ALL
            .iter()
            .copied()
            .find(|tier| self.range(*tier).is_ok_and(|r| r.contains(port)))
    }

    pub(crate) fn require_range(&self, tier: RangeTier) -> Result<PortRange> {
        self.range(tier).map_err(|e| match e {
            Error::InvalidRange { start, end, reason } => Error::InvalidRange {
                start,
                end,
                reason: format!("tier '{}': {}", tier, reason),
            },
            other => other,
        })
    }
}
