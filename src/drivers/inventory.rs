//! Backend Inventory
//!
//! In-memory stand-in for the storage a driver manages: backend shares
//! keyed by path, their usage and data fingerprint, and snapshots. Drivers
//! layer their naming and protocol rules on top of it.

use crate::config::BackendConfig;
use crate::domain::model::new_id;
use crate::domain::ports::PoolStats;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Records
// =============================================================================

/// A share as the backend sees it
#[derive(Debug, Clone)]
pub struct BackendShare {
    /// Control plane id; `None` once unmanaged
    pub owner: Option<String>,
    pub pool: String,
    pub path: String,
    pub size_gb: u64,
    pub used_gb: u64,
    /// Stands in for the share's data
    pub fingerprint: String,
    /// Rule id to `type:to:level`
    pub access: BTreeMap<String, String>,
}

/// A snapshot as the backend sees it
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub source_path: String,
    pub location: String,
    pub size_gb: u64,
    pub fingerprint: String,
}

// =============================================================================
// Inventory
// =============================================================================

/// Simulated backend storage
#[derive(Debug)]
pub struct Inventory {
    backend: String,
    pools: BTreeMap<String, u64>,
    thin: bool,
    reserved_percentage: u8,
    max_over_subscription_ratio: f64,
    capabilities: BTreeMap<String, String>,
    shares: RwLock<BTreeMap<String, BackendShare>>,
    snapshots: RwLock<BTreeMap<String, BackendSnapshot>>,
}

impl Inventory {
    pub fn new(backend: &str, config: &BackendConfig) -> Self {
        Self {
            backend: backend.to_string(),
            pools: config
                .pools
                .iter()
                .map(|p| (p.name.clone(), p.total_capacity_gb))
                .collect(),
            thin: config.thin_provisioning,
            reserved_percentage: config.reserved_percentage,
            max_over_subscription_ratio: config.max_over_subscription_ratio,
            capabilities: config.capabilities.clone(),
            shares: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
        }
    }

    fn fatal(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::DriverOperationFatal {
            backend: self.backend.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    fn allocated_in(shares: &BTreeMap<String, BackendShare>, pool: &str) -> u64 {
        shares
            .values()
            .filter(|s| s.pool == pool)
            .map(|s| s.size_gb)
            .sum()
    }

    fn ensure_room(
        &self,
        shares: &BTreeMap<String, BackendShare>,
        pool: &str,
        extra_gb: u64,
        operation: &str,
    ) -> Result<()> {
        let total = *self
            .pools
            .get(pool)
            .ok_or_else(|| self.fatal(operation, format!("unknown pool {}", pool)))?;
        if self.thin {
            return Ok(());
        }
        let allocated = Self::allocated_in(shares, pool);
        if allocated + extra_gb > total {
            return Err(self.fatal(
                operation,
                format!(
                    "pool {} has {} GiB free, {} GiB requested",
                    pool,
                    total.saturating_sub(allocated),
                    extra_gb
                ),
            ));
        }
        Ok(())
    }

    fn path_of(shares: &BTreeMap<String, BackendShare>, owner: &str) -> Option<String> {
        shares
            .values()
            .find(|s| s.owner.as_deref() == Some(owner))
            .map(|s| s.path.clone())
    }

    // -------------------------------------------------------------------------
    // Shares
    // -------------------------------------------------------------------------

    /// Provision a new backend share for `owner`
    pub fn add_share(&self, owner: &str, pool: &str, path: &str, size_gb: u64) -> Result<()> {
        self.add_share_with_data(owner, pool, path, size_gb, new_id())
    }

    /// Provision a backend share holding a copy of existing data
    pub fn add_share_with_data(
        &self,
        owner: &str,
        pool: &str,
        path: &str,
        size_gb: u64,
        fingerprint: String,
    ) -> Result<()> {
        let mut shares = self.shares.write();
        if shares.contains_key(path) {
            return Err(self.fatal("create_share", format!("{} already exists", path)));
        }
        self.ensure_room(&shares, pool, size_gb, "create_share")?;

        shares.insert(
            path.to_string(),
            BackendShare {
                owner: Some(owner.to_string()),
                pool: pool.to_string(),
                path: path.to_string(),
                size_gb,
                used_gb: 0,
                fingerprint,
                access: BTreeMap::new(),
            },
        );
        debug!("{}: provisioned {} ({} GiB) in pool {}", self.backend, path, size_gb, pool);
        Ok(())
    }

    /// Place data on the backend that no share owns yet
    pub fn seed_unowned(&self, pool: &str, path: &str, size_gb: u64, used_gb: u64) -> String {
        let fingerprint = new_id();
        self.shares.write().insert(
            path.to_string(),
            BackendShare {
                owner: None,
                pool: pool.to_string(),
                path: path.to_string(),
                size_gb,
                used_gb,
                fingerprint: fingerprint.clone(),
                access: BTreeMap::new(),
            },
        );
        fingerprint
    }

    /// Backend share owned by `owner`
    pub fn share(&self, owner: &str) -> Option<BackendShare> {
        let shares = self.shares.read();
        Self::path_of(&shares, owner).and_then(|p| shares.get(&p).cloned())
    }

    /// Backend share at `path`, owned or not
    pub fn share_at(&self, path: &str) -> Option<BackendShare> {
        self.shares.read().get(path).cloned()
    }

    /// Modify the share owned by `owner`
    pub fn with_share<R>(
        &self,
        owner: &str,
        operation: &str,
        f: impl FnOnce(&mut BackendShare) -> Result<R>,
    ) -> Result<R> {
        let mut shares = self.shares.write();
        let path = Self::path_of(&shares, owner)
            .ok_or_else(|| self.fatal(operation, format!("share {} not found", owner)))?;
        match shares.get_mut(&path) {
            Some(share) => f(share),
            None => Err(self.fatal(operation, format!("share {} not found", owner))),
        }
    }

    /// Remove the share owned by `owner`; a missing share is not an error
    pub fn remove_share(&self, owner: &str) -> Option<BackendShare> {
        let mut shares = self.shares.write();
        let path = Self::path_of(&shares, owner)?;
        shares.remove(&path)
    }

    /// Grow a share, checking pool room for thick pools
    pub fn extend(&self, owner: &str, new_size_gb: u64) -> Result<()> {
        let mut shares = self.shares.write();
        let path = Self::path_of(&shares, owner)
            .ok_or_else(|| self.fatal("extend_share", format!("share {} not found", owner)))?;
        let (pool, size) = match shares.get(&path) {
            Some(s) => (s.pool.clone(), s.size_gb),
            None => return Err(self.fatal("extend_share", "share vanished")),
        };
        self.ensure_room(&shares, &pool, new_size_gb.saturating_sub(size), "extend_share")?;
        if let Some(share) = shares.get_mut(&path) {
            share.size_gb = new_size_gb;
        }
        Ok(())
    }

    /// Shrink a share unless its data would not fit
    pub fn shrink(&self, owner: &str, new_size_gb: u64) -> Result<()> {
        self.with_share(owner, "shrink_share", |share| {
            if share.used_gb > new_size_gb {
                return Err(Error::ShrinkPossibleDataLoss {
                    share_id: owner.to_string(),
                    used_gb: share.used_gb,
                    new_size: new_size_gb,
                });
            }
            share.size_gb = new_size_gb;
            Ok(())
        })
    }

    /// Set how much data a share holds
    pub fn set_usage(&self, owner: &str, used_gb: u64) -> Result<()> {
        self.with_share(owner, "set_usage", |share| {
            share.used_gb = used_gb;
            Ok(())
        })
    }

    pub fn grant(&self, owner: &str, rule_id: &str, entry: String) -> Result<()> {
        self.with_share(owner, "allow_access", |share| {
            share.access.insert(rule_id.to_string(), entry);
            Ok(())
        })
    }

    pub fn revoke(&self, owner: &str, rule_id: &str) -> Result<()> {
        self.with_share(owner, "deny_access", |share| {
            share.access.remove(rule_id);
            Ok(())
        })
    }

    /// Attach an unowned share at `path` to `owner`
    pub fn adopt(&self, path: &str, owner: &str) -> Result<BackendShare> {
        let mut shares = self.shares.write();
        let share = shares
            .get_mut(path)
            .ok_or_else(|| self.fatal("manage_existing", format!("no share at {}", path)))?;
        if let Some(current) = &share.owner {
            return Err(self.fatal(
                "manage_existing",
                format!("{} is already managed as {}", path, current),
            ));
        }
        share.owner = Some(owner.to_string());
        Ok(share.clone())
    }

    /// Detach a share from its owner, keeping the data
    pub fn release(&self, owner: &str) -> Result<()> {
        self.with_share(owner, "unmanage", |share| {
            share.owner = None;
            share.access.clear();
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Snapshot the share owned by `owner`
    pub fn add_snapshot(&self, snapshot_id: &str, owner: &str, location: String) -> Result<()> {
        let source = self
            .share(owner)
            .ok_or_else(|| self.fatal("create_snapshot", format!("share {} not found", owner)))?;
        self.snapshots.write().insert(
            snapshot_id.to_string(),
            BackendSnapshot {
                source_path: source.path,
                location,
                size_gb: source.size_gb,
                fingerprint: source.fingerprint,
            },
        );
        Ok(())
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Option<BackendSnapshot> {
        self.snapshots.read().get(snapshot_id).cloned()
    }

    pub fn remove_snapshot(&self, snapshot_id: &str) -> Option<BackendSnapshot> {
        self.snapshots.write().remove(snapshot_id)
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.pools.contains_key(pool)
    }

    pub fn share_count(&self) -> usize {
        self.shares.read().len()
    }

    /// Capacity report for every pool
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let shares = self.shares.read();
        self.pools
            .iter()
            .map(|(name, total)| {
                let allocated = Self::allocated_in(&shares, name);
                let used: u64 = shares
                    .values()
                    .filter(|s| &s.pool == name)
                    .map(|s| s.used_gb)
                    .sum();
                let free = if self.thin {
                    total.saturating_sub(used)
                } else {
                    total.saturating_sub(allocated)
                };
                let mut capabilities = self.capabilities.clone();
                capabilities.insert("pool_name".to_string(), name.clone());

                PoolStats {
                    pool_name: name.clone(),
                    total_capacity_gb: *total,
                    free_capacity_gb: free,
                    allocated_capacity_gb: allocated,
                    provisioned_capacity_gb: allocated,
                    reserved_percentage: self.reserved_percentage,
                    thin_provisioning: self.thin,
                    max_over_subscription_ratio: self.max_over_subscription_ratio,
                    capabilities,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use assert_matches::assert_matches;

    fn inventory(thin: bool) -> Inventory {
        let config = BackendConfig {
            thin_provisioning: thin,
            pools: vec![PoolConfig {
                name: "p1".into(),
                total_capacity_gb: 10,
            }],
            ..Default::default()
        };
        Inventory::new("b1", &config)
    }

    #[test]
    fn test_thick_pool_accounting() {
        let inv = inventory(false);
        inv.add_share("s1", "p1", "/p1/s1", 4).unwrap();

        let stats = inv.pool_stats();
        assert_eq!(stats[0].allocated_capacity_gb, 4);
        assert_eq!(stats[0].free_capacity_gb, 6);

        let err = inv.add_share("s2", "p1", "/p1/s2", 7).unwrap_err();
        assert_matches!(err, Error::DriverOperationFatal { .. });
    }

    #[test]
    fn test_thin_pool_reports_usage() {
        let inv = inventory(true);
        inv.add_share("s1", "p1", "/p1/s1", 50).unwrap();
        inv.set_usage("s1", 3).unwrap();

        let stats = inv.pool_stats();
        assert_eq!(stats[0].provisioned_capacity_gb, 50);
        assert_eq!(stats[0].free_capacity_gb, 7);
    }

    #[test]
    fn test_shrink_guards_data() {
        let inv = inventory(false);
        inv.add_share("s1", "p1", "/p1/s1", 5).unwrap();
        inv.set_usage("s1", 3).unwrap();

        assert_matches!(inv.shrink("s1", 2), Err(Error::ShrinkPossibleDataLoss { used_gb: 3, .. }));
        inv.shrink("s1", 3).unwrap();
        assert_eq!(inv.share("s1").unwrap().size_gb, 3);
    }

    #[test]
    fn test_release_and_adopt_keep_data() {
        let inv = inventory(false);
        inv.add_share("s1", "p1", "/p1/s1", 2).unwrap();
        let before = inv.share("s1").unwrap().fingerprint;

        inv.release("s1").unwrap();
        assert!(inv.share("s1").is_none());

        let adopted = inv.adopt("/p1/s1", "s2").unwrap();
        assert_eq!(adopted.fingerprint, before);
        assert!(inv.adopt("/p1/s1", "s3").is_err());
    }
}
