//! Filter Scheduler
//!
//! Picks a pool for a placement request: filter every fresh pool, weigh
//! the survivors, then reserve capacity on the best one. If another
//! request won the race for that pool the next candidate is tried.

use super::filters::{filter_by_name, PoolFilter};
use super::host_manager::{HostManager, Reservation};
use super::weighers::{weigh_pools, weigher_by_name, WeighedPool, WeigherEntry};
use crate::config::SchedulerConfig;
use crate::domain::model::{PoolRef, ShareProtocol};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Request
// =============================================================================

/// Replica placement context
#[derive(Debug, Clone, Default)]
pub struct ReplicaPlacement {
    /// Replication domain of the active replica's backend
    pub domain: Option<String>,
    /// Pools that already hold a replica of the share
    pub existing_hosts: Vec<PoolRef>,
}

/// What a placement must satisfy
#[derive(Debug, Clone, Default)]
pub struct SchedulingRequest {
    pub size_gb: u64,
    pub protocol: Option<ShareProtocol>,
    pub extra_specs: BTreeMap<String, String>,
    pub availability_zone: Option<String>,
    /// Pool of the consistency group the share joins
    pub consistency_group_host: Option<PoolRef>,
    /// Placing a consistency group itself
    pub require_cg_support: bool,
    pub replication: Option<ReplicaPlacement>,
    /// Hosts of shares named by the `same_host` hint
    pub same_host: Vec<PoolRef>,
    /// Hosts of shares named by the `different_host` hint
    pub different_host: Vec<PoolRef>,
    /// Host of the source snapshot's share
    pub snapshot_host: Option<PoolRef>,
    /// Hosts tried by earlier attempts
    pub tried_hosts: Vec<PoolRef>,
}

impl SchedulingRequest {
    pub fn new(size_gb: u64) -> Self {
        Self {
            size_gb,
            ..Default::default()
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct FilterScheduler {
    hosts: Arc<HostManager>,
    filters: Vec<Box<dyn PoolFilter>>,
    weighers: Vec<WeigherEntry>,
}

impl FilterScheduler {
    /// Build the configured filter and weigher chains
    pub fn new(config: &SchedulerConfig, hosts: Arc<HostManager>) -> Result<Self> {
        let filters = config
            .filters
            .iter()
            .map(|name| filter_by_name(name))
            .collect::<Result<Vec<_>>>()?;
        let weighers = config
            .weighers
            .iter()
            .map(|name| weigher_by_name(name, config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            hosts,
            filters,
            weighers,
        })
    }

    pub fn hosts(&self) -> &Arc<HostManager> {
        &self.hosts
    }

    /// Pools that pass every filter, best first
    pub fn candidates(&self, request: &SchedulingRequest) -> Result<Vec<WeighedPool>> {
        let mut pools = self.hosts.schedulable();
        if pools.is_empty() {
            return Err(Error::NoValidHost {
                reason: "no pools reported".into(),
            });
        }

        for filter in &self.filters {
            let before = pools.len();
            pools.retain(|pool| filter.passes(pool, request));
            debug!(
                "{} kept {} of {} pools",
                filter.name(),
                pools.len(),
                before
            );
            if pools.is_empty() {
                return Err(Error::NoValidHost {
                    reason: format!("filter {} rejected every pool", filter.name()),
                });
            }
        }

        Ok(weigh_pools(pools, &self.weighers))
    }

    /// Choose a pool and hold capacity on it
    pub fn select_and_reserve(&self, request: &SchedulingRequest) -> Result<Reservation> {
        let candidates = self.candidates(request)?;
        for candidate in &candidates {
            match self.hosts.reserve(&candidate.pool.host, request.size_gb) {
                Ok(reservation) => {
                    info!(
                        "Selected {} for {}G (weight {:.3})",
                        reservation.host, request.size_gb, candidate.weight
                    );
                    return Ok(reservation);
                }
                Err(e) => debug!("Lost reservation race on {}: {}", candidate.pool.host, e),
            }
        }
        Err(Error::NoValidHost {
            reason: "capacity was claimed by concurrent requests".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::host_manager::tests::{backend_stats, pool_stats};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn scheduler(free: &[(&str, u64)]) -> FilterScheduler {
        let hosts = Arc::new(HostManager::new(Duration::from_secs(60)));
        let pools = free.iter().map(|(name, f)| pool_stats(name, 100, *f)).collect();
        hosts.update_from_stats(&backend_stats("b1", pools));
        FilterScheduler::new(&SchedulerConfig::default(), hosts).unwrap()
    }

    #[test]
    fn test_selects_most_free() {
        let scheduler = scheduler(&[("small", 10), ("large", 90)]);
        let reservation = scheduler.select_and_reserve(&SchedulingRequest::new(5)).unwrap();
        assert_eq!(reservation.host, PoolRef::new("b1", "large"));
    }

    #[test]
    fn test_no_valid_host_when_nothing_fits() {
        let scheduler = scheduler(&[("small", 10)]);
        assert_matches!(
            scheduler.select_and_reserve(&SchedulingRequest::new(50)),
            Err(Error::NoValidHost { .. })
        );
    }

    #[test]
    fn test_selected_pool_always_has_room() {
        let scheduler = scheduler(&[("a", 10), ("b", 7), ("c", 3)]);
        let mut placed = 0;
        while let Ok(reservation) = scheduler.select_and_reserve(&SchedulingRequest::new(3)) {
            let pool = scheduler.hosts().get(&reservation.host).unwrap();
            assert!(pool.free_capacity_gb >= pool.pending_gb);
            placed += 1;
        }
        // 3 + 2 + 1 placements of 3G
        assert_eq!(placed, 6);
    }

    #[test]
    fn test_retry_excludes_tried_hosts() {
        let scheduler = scheduler(&[("a", 50), ("b", 40)]);
        let mut request = SchedulingRequest::new(1);
        request.tried_hosts.push(PoolRef::new("b1", "a"));
        let reservation = scheduler.select_and_reserve(&request).unwrap();
        assert_eq!(reservation.host, PoolRef::new("b1", "b"));
    }

    #[test]
    fn test_unknown_filter_is_configuration_error() {
        let mut config = SchedulerConfig::default();
        config.filters.push("JsonFilter".into());
        let hosts = Arc::new(HostManager::new(Duration::from_secs(60)));
        assert_matches!(
            FilterScheduler::new(&config, hosts).err(),
            Some(Error::Configuration(_))
        );
    }
}
