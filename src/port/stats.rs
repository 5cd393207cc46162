use super::store::AllocationTable;
use crate::config::Config;
use serde::Serialize;
use std::collections::BTreeMap;

/// Label for leases whose port lies in no configured tier.
pub const UNASSIGNED_TIER: &str = "unassigned";

/// Lease counts for observability. Not used for any allocation decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationStats {
    pub total: usize,
    pub locked: usize,
    pub per_environment: BTreeMap<String, usize>,
    pub per_range_tier: BTreeMap<String, usize>,
    pub per_service: BTreeMap<String, usize>,
}

impl AllocationStats {
    pub fn from_table(table: &AllocationTable, config: &Config) -> Self {
        let mut stats = Self::default();

        for allocation in table.iter() {
            stats.total += 1;
            if allocation.is_locked {
                stats.locked += 1;
            }
            *stats
                .per_environment
                .entry(allocation.environment_id.clone())
                .or_default() += 1;
            *stats
                .per_service
                .entry(allocation.service_name.clone())
                .or_default() += 1;

            let tier = config
                .tier_of(allocation.port)
                .map(|t| t.to_string())
                .unwrap_or_else(|| UNASSIGNED_TIER.to_string());
            *stats.per_range_tier.entry(tier).or_default() += 1;
        }

        stats
    }

    /// Number of leases held by `environment_id`.
    pub fn environment_count(&self, environment_id: &str) -> usize {
        self.per_environment
            .get(environment_id)
            .copied()
            .unwrap_or(0)
    }
}
