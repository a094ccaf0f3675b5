//! Host Manager
//!
//! Process-wide cache of pool capabilities and capacity, refreshed from
//! driver stats. Placement reserves capacity here before dispatch so that
//! concurrent requests cannot both claim the last free GiB of a pool.
//! Refreshes keep outstanding reservations subtracted from the capacity a
//! driver reports.

use crate::domain::model::{PoolRef, ReplicationType, ShareProtocol};
use crate::domain::ports::{BackendStats, PoolStats};
use crate::domain::share_type::{
    bool_spec, CG_SUPPORT_SPEC, DHSS_SPEC, REPLICATION_TYPE_SPEC, SNAPSHOT_SUPPORT_SPEC,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Pool State
// =============================================================================

/// Scheduler view of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolState {
    pub host: PoolRef,
    pub share_backend_name: String,
    pub driver_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub availability_zone: String,
    pub storage_protocols: Vec<ShareProtocol>,
    pub driver_handles_share_servers: bool,
    pub snapshot_support: bool,
    pub consistency_group_support: bool,
    pub replication_type: Option<ReplicationType>,
    pub replication_domain: Option<String>,

    pub total_capacity_gb: u64,
    /// Free capacity as last reported and consumed locally
    pub free_capacity_gb: u64,
    pub allocated_capacity_gb: u64,
    pub provisioned_capacity_gb: u64,
    pub reserved_percentage: u8,
    pub thin_provisioning: bool,
    pub max_over_subscription_ratio: f64,
    pub capabilities: BTreeMap<String, String>,

    /// Capacity reserved by placements not yet confirmed
    pub pending_gb: u64,
    pub updated_at: DateTime<Utc>,
}

impl PoolState {
    fn from_stats(backend: &BackendStats, pool: &PoolStats, now: DateTime<Utc>) -> Self {
        Self {
            host: PoolRef::new(&backend.backend_name, &pool.pool_name),
            share_backend_name: backend.share_backend_name.clone(),
            driver_name: backend.driver_name.clone(),
            vendor_name: backend.vendor_name.clone(),
            driver_version: backend.driver_version.clone(),
            availability_zone: backend.availability_zone.clone(),
            storage_protocols: backend.storage_protocols.clone(),
            driver_handles_share_servers: backend.driver_handles_share_servers,
            snapshot_support: backend.snapshot_support,
            consistency_group_support: backend.consistency_group_support,
            replication_type: backend.replication_type,
            replication_domain: backend.replication_domain.clone(),
            total_capacity_gb: pool.total_capacity_gb,
            free_capacity_gb: pool.free_capacity_gb,
            allocated_capacity_gb: pool.allocated_capacity_gb,
            provisioned_capacity_gb: pool.provisioned_capacity_gb,
            reserved_percentage: pool.reserved_percentage,
            thin_provisioning: pool.thin_provisioning,
            max_over_subscription_ratio: pool.max_over_subscription_ratio,
            capabilities: pool.capabilities.clone(),
            pending_gb: 0,
            updated_at: now,
        }
    }

    /// Free capacity net of outstanding reservations
    pub fn available_gb(&self) -> u64 {
        self.free_capacity_gb.saturating_sub(self.pending_gb)
    }

    /// Provisioned capacity including outstanding reservations
    pub fn committed_gb(&self) -> u64 {
        self.provisioned_capacity_gb + self.pending_gb
    }

    fn reserved_fraction(&self) -> f64 {
        f64::from(self.reserved_percentage) / 100.0
    }

    fn uses_over_subscription(&self) -> bool {
        self.thin_provisioning && self.max_over_subscription_ratio >= 1.0
    }

    /// Whether a share of `size_gb` fits
    ///
    /// Free space is taken after the reserved percentage. Thin pools are
    /// limited by the over-subscription ratio instead of physical space.
    pub fn fits(&self, size_gb: u64) -> bool {
        let total = self.total_capacity_gb as f64;
        if total <= 0.0 {
            return false;
        }
        let size = size_gb as f64;
        let free = (self.available_gb() as f64 - total * self.reserved_fraction()).floor();

        if self.uses_over_subscription() {
            let provisioned_ratio = (self.committed_gb() as f64 + size) / total;
            if provisioned_ratio > self.max_over_subscription_ratio {
                return false;
            }
            return free * self.max_over_subscription_ratio >= size;
        }
        if self.thin_provisioning {
            return false;
        }
        free >= size
    }

    /// Free capacity used for ranking; virtual for thin pools
    pub fn weighable_free_gb(&self) -> f64 {
        let total = self.total_capacity_gb as f64;
        let reserved = (total * self.reserved_fraction()).floor();
        if self.uses_over_subscription() {
            total * self.max_over_subscription_ratio - self.committed_gb() as f64 - reserved
        } else {
            self.available_gb() as f64 - reserved
        }
    }

    /// Capability value as matched by extra specs
    pub fn capability(&self, key: &str) -> Option<String> {
        let value = match key {
            DHSS_SPEC => bool_spec(self.driver_handles_share_servers),
            SNAPSHOT_SUPPORT_SPEC => bool_spec(self.snapshot_support),
            CG_SUPPORT_SPEC => bool_spec(self.consistency_group_support),
            REPLICATION_TYPE_SPEC => self.replication_type?.as_str().to_string(),
            "replication_domain" => self.replication_domain.clone()?,
            "share_backend_name" => self.share_backend_name.clone(),
            "driver_name" => self.driver_name.clone(),
            "vendor_name" => self.vendor_name.clone(),
            "driver_version" => self.driver_version.clone(),
            "availability_zone" => self.availability_zone.clone(),
            "storage_protocol" => self
                .storage_protocols
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join("_"),
            "pool_name" => self.host.pool.clone(),
            "thin_provisioning" => bool_spec(self.thin_provisioning),
            "total_capacity_gb" => self.total_capacity_gb.to_string(),
            "free_capacity_gb" => self.available_gb().to_string(),
            "reserved_percentage" => self.reserved_percentage.to_string(),
            "max_over_subscription_ratio" => self.max_over_subscription_ratio.to_string(),
            other => return self.capabilities.get(other).cloned(),
        };
        Some(value)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match chrono::Duration::from_std(stale_after) {
            Ok(window) => now - self.updated_at <= window,
            Err(_) => true,
        }
    }
}

// =============================================================================
// Reservations
// =============================================================================

/// Capacity held on a pool for one placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub host: PoolRef,
    pub size_gb: u64,
    /// Stats generation the reservation was taken against
    pub reported_at: DateTime<Utc>,
}

// =============================================================================
// Host Manager
// =============================================================================

/// Capability cache keyed by pool
pub struct HostManager {
    pools: RwLock<BTreeMap<PoolRef, PoolState>>,
    stale_after: Duration,
}

impl HostManager {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
            stale_after,
        }
    }

    /// Replace a backend's pools with freshly reported stats
    ///
    /// Pools the backend no longer reports are dropped. Pending
    /// reservations carry over to pools that remain.
    pub fn update_from_stats(&self, stats: &BackendStats) -> usize {
        let now = Utc::now();
        let mut pools = self.pools.write();

        let pending: HashMap<PoolRef, u64> = pools
            .iter()
            .filter(|(host, _)| host.backend == stats.backend_name)
            .map(|(host, state)| (host.clone(), state.pending_gb))
            .collect();
        pools.retain(|host, _| host.backend != stats.backend_name);

        for pool in &stats.pools {
            let mut state = PoolState::from_stats(stats, pool, now);
            state.pending_gb = pending.get(&state.host).copied().unwrap_or(0);
            pools.insert(state.host.clone(), state);
        }

        info!(
            "Refreshed {} pools for backend {}",
            stats.pools.len(),
            stats.backend_name
        );
        stats.pools.len()
    }

    /// Pools fresh enough to schedule onto
    pub fn schedulable(&self) -> Vec<PoolState> {
        let now = Utc::now();
        self.pools
            .read()
            .values()
            .filter(|p| p.is_fresh(now, self.stale_after))
            .cloned()
            .collect()
    }

    /// Every cached pool, stale or not
    pub fn all(&self) -> Vec<PoolState> {
        self.pools.read().values().cloned().collect()
    }

    pub fn get(&self, host: &PoolRef) -> Option<PoolState> {
        self.pools.read().get(host).cloned()
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hold capacity on a pool if it still fits
    pub fn reserve(&self, host: &PoolRef, size_gb: u64) -> Result<Reservation> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(host)
            .ok_or_else(|| Error::not_found("Pool", host.to_string()))?;
        if !pool.fits(size_gb) {
            return Err(Error::InsufficientCapacity {
                requested: size_gb,
                available: pool.available_gb(),
            });
        }
        pool.pending_gb += size_gb;
        debug!("Reserved {}G on {} ({}G pending)", size_gb, host, pool.pending_gb);
        Ok(Reservation {
            host: host.clone(),
            size_gb,
            reported_at: pool.updated_at,
        })
    }

    /// Turn a reservation into consumed capacity
    ///
    /// Stats refreshed after the reservation already count the new share,
    /// so only the pending hold is dropped in that case.
    pub fn confirm(&self, reservation: &Reservation) {
        if let Some(pool) = self.pools.write().get_mut(&reservation.host) {
            pool.pending_gb = pool.pending_gb.saturating_sub(reservation.size_gb);
            if pool.updated_at == reservation.reported_at {
                Self::consume_locked(pool, reservation.size_gb);
            } else {
                debug!(
                    "Stats for {} refreshed since reservation, not consuming {}G again",
                    reservation.host, reservation.size_gb
                );
            }
        }
    }

    /// Account for capacity taken without a reservation (managed shares)
    pub fn consume(&self, host: &PoolRef, size_gb: u64) {
        if let Some(pool) = self.pools.write().get_mut(host) {
            Self::consume_locked(pool, size_gb);
        }
    }

    fn consume_locked(pool: &mut PoolState, size_gb: u64) {
        pool.free_capacity_gb = pool.free_capacity_gb.saturating_sub(size_gb);
        pool.allocated_capacity_gb += size_gb;
        pool.provisioned_capacity_gb += size_gb;
    }

    /// Give a reservation back
    pub fn rollback(&self, reservation: &Reservation) {
        if let Some(pool) = self.pools.write().get_mut(&reservation.host) {
            pool.pending_gb = pool.pending_gb.saturating_sub(reservation.size_gb);
            debug!("Rolled back {}G on {}", reservation.size_gb, reservation.host);
        }
    }

    /// Return capacity freed by a deleted or shrunk share
    pub fn release(&self, host: &PoolRef, size_gb: u64) {
        if let Some(pool) = self.pools.write().get_mut(host) {
            pool.free_capacity_gb = (pool.free_capacity_gb + size_gb).min(pool.total_capacity_gb);
            pool.allocated_capacity_gb = pool.allocated_capacity_gb.saturating_sub(size_gb);
            pool.provisioned_capacity_gb = pool.provisioned_capacity_gb.saturating_sub(size_gb);
        }
    }

    /// Outstanding reservations across all pools
    pub fn pending_total(&self) -> u64 {
        self.pools.read().values().map(|p| p.pending_gb).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    pub(crate) fn pool_stats(name: &str, total: u64, free: u64) -> PoolStats {
        PoolStats {
            pool_name: name.to_string(),
            total_capacity_gb: total,
            free_capacity_gb: free,
            allocated_capacity_gb: total - free,
            provisioned_capacity_gb: total - free,
            reserved_percentage: 0,
            thin_provisioning: false,
            max_over_subscription_ratio: 1.0,
            capabilities: BTreeMap::new(),
        }
    }

    pub(crate) fn backend_stats(backend: &str, pools: Vec<PoolStats>) -> BackendStats {
        BackendStats {
            backend_name: backend.to_string(),
            share_backend_name: backend.to_string(),
            driver_name: "FakeShareDriver".into(),
            vendor_name: "Test".into(),
            driver_version: "1.0".into(),
            storage_protocols: vec![ShareProtocol::Nfs, ShareProtocol::Cifs],
            driver_handles_share_servers: false,
            snapshot_support: true,
            consistency_group_support: false,
            replication_type: None,
            replication_domain: None,
            availability_zone: "nova".into(),
            pools,
        }
    }

    fn state(total: u64, free: u64) -> PoolState {
        let stats = backend_stats("b1", vec![pool_stats("p1", total, free)]);
        PoolState::from_stats(&stats, &stats.pools[0], Utc::now())
    }

    #[test]
    fn test_thick_fit_respects_reserved_percentage() {
        let mut pool = state(100, 20);
        assert!(pool.fits(20));
        pool.reserved_percentage = 10;
        assert!(!pool.fits(20));
        assert!(pool.fits(10));
    }

    #[test]
    fn test_thin_fit_uses_over_subscription() {
        let mut pool = state(100, 10);
        pool.thin_provisioning = true;
        pool.max_over_subscription_ratio = 2.0;
        pool.provisioned_capacity_gb = 150;

        assert!(pool.fits(20));
        // (150 + 60) / 100 > 2.0
        assert!(!pool.fits(60));

        pool.max_over_subscription_ratio = 0.5;
        assert!(!pool.fits(1));
    }

    #[test]
    fn test_zero_total_never_fits() {
        assert!(!state(0, 0).fits(0));
    }

    #[test]
    fn test_weighable_free() {
        let mut pool = state(100, 40);
        pool.reserved_percentage = 10;
        assert_eq!(pool.weighable_free_gb(), 30.0);

        pool.thin_provisioning = true;
        pool.max_over_subscription_ratio = 2.0;
        pool.provisioned_capacity_gb = 50;
        assert_eq!(pool.weighable_free_gb(), 200.0 - 50.0 - 10.0);
    }

    #[test]
    fn test_capability_lookup() {
        let mut pool = state(10, 10);
        pool.capabilities.insert("compression".into(), "True".into());
        assert_eq!(pool.capability(DHSS_SPEC).as_deref(), Some("False"));
        assert_eq!(pool.capability("storage_protocol").as_deref(), Some("NFS_CIFS"));
        assert_eq!(pool.capability("compression").as_deref(), Some("True"));
        assert_eq!(pool.capability(REPLICATION_TYPE_SPEC), None);
        assert_eq!(pool.capability("dedupe"), None);
    }

    #[test]
    fn test_reserve_and_rollback() {
        let hosts = HostManager::new(Duration::from_secs(60));
        hosts.update_from_stats(&backend_stats("b1", vec![pool_stats("p1", 10, 10)]));
        let host = PoolRef::new("b1", "p1");

        let first = hosts.reserve(&host, 6).unwrap();
        assert_matches!(
            hosts.reserve(&host, 6),
            Err(Error::InsufficientCapacity { requested: 6, available: 4 })
        );

        hosts.rollback(&first);
        assert_eq!(hosts.pending_total(), 0);
        let second = hosts.reserve(&host, 6).unwrap();
        hosts.confirm(&second);

        let pool = hosts.get(&host).unwrap();
        assert_eq!(pool.pending_gb, 0);
        assert_eq!(pool.free_capacity_gb, 4);
    }

    #[test]
    fn test_refresh_keeps_pending_and_drops_missing_pools() {
        let hosts = HostManager::new(Duration::from_secs(60));
        hosts.update_from_stats(&backend_stats(
            "b1",
            vec![pool_stats("p1", 10, 10), pool_stats("p2", 10, 10)],
        ));
        hosts.reserve(&PoolRef::new("b1", "p1"), 3).unwrap();

        hosts.update_from_stats(&backend_stats("b1", vec![pool_stats("p1", 10, 10)]));
        assert_eq!(hosts.len(), 1);
        let pool = hosts.get(&PoolRef::new("b1", "p1")).unwrap();
        assert_eq!(pool.pending_gb, 3);
        assert_eq!(pool.available_gb(), 7);
    }

    #[test]
    fn test_confirm_after_refresh_does_not_double_count() {
        let hosts = HostManager::new(Duration::from_secs(60));
        hosts.update_from_stats(&backend_stats("b1", vec![pool_stats("p1", 10, 10)]));
        let host = PoolRef::new("b1", "p1");
        let reservation = hosts.reserve(&host, 4).unwrap();

        // The backend already reports the new share
        hosts.update_from_stats(&backend_stats("b1", vec![pool_stats("p1", 10, 6)]));
        hosts.confirm(&reservation);

        let pool = hosts.get(&host).unwrap();
        assert_eq!(pool.pending_gb, 0);
        assert_eq!(pool.free_capacity_gb, 6);
        assert_eq!(pool.allocated_capacity_gb, 4);
    }

    #[test]
    fn test_stale_pools_not_schedulable() {
        let hosts = HostManager::new(Duration::from_secs(60));
        hosts.update_from_stats(&backend_stats("b1", vec![pool_stats("p1", 10, 10)]));
        hosts
            .pools
            .write()
            .values_mut()
            .for_each(|p| p.updated_at = Utc::now() - chrono::Duration::seconds(120));

        assert!(hosts.schedulable().is_empty());
        assert_eq!(hosts.all().len(), 1);
    }
}
