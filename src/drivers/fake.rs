//! Fake Driver
//!
//! Implements every optional operation on top of an [`Inventory`] and adds
//! hooks for exercising the control plane: fault injection, call counts,
//! per-share concurrency tracking and artificial latency.

use crate::config::BackendConfig;
use crate::domain::model::{
    AccessRule, CgSnapshot, ConsistencyGroup, ExportLocation, Replica, ReplicaState, Share,
    ShareNetwork, ShareProtocol, ShareServer, Snapshot,
};
use crate::domain::ports::{
    pool_of, BackendStats, CgSnapshotMemberUpdate, DriverCapabilities, ManagedShare,
    ReplicaStateUpdate, ReplicaUpdate, ReplicationContext, ShareDriver,
};
use crate::domain::share_type::parse_bool_spec;
use crate::drivers::inventory::Inventory;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Faults
// =============================================================================

/// Failure to inject into the next call of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Recoverable, retried by the manager
    Transient,
    /// Terminal
    Fatal,
}

// =============================================================================
// Call Tracking
// =============================================================================

#[derive(Debug, Default)]
struct CallStats {
    calls: HashMap<String, u64>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Decrements the in-flight count for a key when dropped
struct InFlight<'a> {
    stats: &'a Mutex<CallStats>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut stats = self.stats.lock();
        if let Some(n) = stats.in_flight.get_mut(&self.key) {
            *n = n.saturating_sub(1);
        }
    }
}

// =============================================================================
// Fake Driver
// =============================================================================

/// Driver for tests and local experiments
pub struct FakeDriver {
    name: String,
    zone: String,
    config: BackendConfig,
    capabilities: Mutex<DriverCapabilities>,
    protocols: Vec<ShareProtocol>,
    inventory: Inventory,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    stats: Mutex<CallStats>,
    delay: Mutex<Duration>,
    partial_cgsnapshot: Mutex<bool>,
    pending_sync: Mutex<HashSet<String>>,
    servers: Mutex<BTreeMap<String, String>>,
    healthy: Mutex<bool>,
}

impl FakeDriver {
    pub fn new(name: &str, config: &BackendConfig, zone: &str) -> Self {
        let protocols = config
            .option_or("protocols", "NFS,CIFS")
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect();
        let cg = config
            .options
            .get("consistency_group_support")
            .and_then(|v| parse_bool_spec(v))
            .unwrap_or(true);

        let capabilities = DriverCapabilities {
            handles_share_servers: config.driver_handles_share_servers,
            supports_snapshots: true,
            supports_create_from_snapshot: true,
            supports_cg: cg,
            supports_replication: config.replication_domain.is_some(),
            supports_manage: !config.driver_handles_share_servers,
        };

        Self {
            name: name.to_string(),
            zone: zone.to_string(),
            config: config.clone(),
            capabilities: Mutex::new(capabilities),
            protocols,
            inventory: Inventory::new(name, config),
            faults: Mutex::new(HashMap::new()),
            stats: Mutex::new(CallStats::default()),
            delay: Mutex::new(Duration::ZERO),
            partial_cgsnapshot: Mutex::new(false),
            pending_sync: Mutex::new(HashSet::new()),
            servers: Mutex::new(BTreeMap::new()),
            healthy: Mutex::new(true),
        }
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Fail the next `times` calls of `operation`
    pub fn inject_fault(&self, operation: &str, fault: Fault, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(operation.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(fault);
        }
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Calls made to `operation`, including failed ones
    pub fn call_count(&self, operation: &str) -> u64 {
        self.stats.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Highest number of concurrent calls seen for a resource
    pub fn max_concurrency(&self, key: &str) -> usize {
        self.stats.lock().max_in_flight.get(key).copied().unwrap_or(0)
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Report one member fewer than requested from `create_cgsnapshot`
    pub fn set_partial_cgsnapshot(&self, partial: bool) {
        *self.partial_cgsnapshot.lock() = partial;
    }

    pub fn set_capabilities(&self, capabilities: DriverCapabilities) {
        *self.capabilities.lock() = capabilities;
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    /// Record how much data a share holds
    pub fn set_share_usage(&self, share_id: &str, used_gb: u64) -> Result<()> {
        self.inventory.set_usage(share_id, used_gb)
    }

    /// Put an unmanaged share on the backend; returns its data fingerprint
    pub fn seed_existing_share(&self, pool: &str, export_path: &str, size_gb: u64) -> String {
        self.inventory.seed_unowned(pool, export_path, size_gb, 0)
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    fn export_path(&self, pool: &str, id: &str) -> String {
        format!("{}.fake:/{}/share-{}", self.name, pool, id)
    }

    // -------------------------------------------------------------------------
    // Call bookkeeping
    // -------------------------------------------------------------------------

    async fn begin(&self, operation: &str, key: &str) -> Result<InFlight<'_>> {
        {
            let mut stats = self.stats.lock();
            *stats.calls.entry(operation.to_string()).or_default() += 1;
            let now = {
                let n = stats.in_flight.entry(key.to_string()).or_default();
                *n += 1;
                *n
            };
            let max = stats.max_in_flight.entry(key.to_string()).or_default();
            *max = (*max).max(now);
        }
        let guard = InFlight {
            stats: &self.stats,
            key: key.to_string(),
        };

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fault = self
            .faults
            .lock()
            .get_mut(operation)
            .and_then(|q| q.pop_front());
        match fault {
            Some(Fault::Transient) => Err(Error::DriverOperationFailed {
                backend: self.name.clone(),
                operation: operation.to_string(),
                reason: "injected transient fault".into(),
            }),
            Some(Fault::Fatal) => Err(Error::DriverOperationFatal {
                backend: self.name.clone(),
                operation: operation.to_string(),
                reason: "injected fatal fault".into(),
            }),
            None => Ok(guard),
        }
    }
}

#[async_trait]
impl ShareDriver for FakeDriver {
    fn backend_name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        *self.capabilities.lock()
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(*self.healthy.lock())
    }

    async fn get_share_stats(&self) -> Result<BackendStats> {
        let _call = self.begin("get_share_stats", &self.name).await?;
        let caps = self.capabilities();
        Ok(BackendStats {
            backend_name: self.name.clone(),
            share_backend_name: self
                .config
                .share_backend_name
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            driver_name: "FakeShareDriver".into(),
            vendor_name: "Open Source".into(),
            driver_version: "1.0".into(),
            storage_protocols: self.protocols.clone(),
            driver_handles_share_servers: caps.handles_share_servers,
            snapshot_support: caps.supports_snapshots,
            consistency_group_support: caps.supports_cg,
            replication_type: caps
                .supports_replication
                .then_some(crate::domain::ReplicationType::Readable),
            replication_domain: self.config.replication_domain.clone(),
            availability_zone: self.zone.clone(),
            pools: self.inventory.pool_stats(),
        })
    }

    async fn create_share(
        &self,
        share: &Share,
        server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        let _call = self.begin("create_share", &share.id).await?;
        if self.capabilities().handles_share_servers && server.is_none() {
            return Err(Error::DriverOperationFatal {
                backend: self.name.clone(),
                operation: "create_share".into(),
                reason: "share server required".into(),
            });
        }
        let pool = pool_of(&self.name, share.host.as_ref())?;
        let path = self.export_path(pool, &share.id);
        self.inventory.add_share(&share.id, pool, &path, share.size_gb)?;
        Ok(vec![ExportLocation::new(path)])
    }

    async fn delete_share(&self, share: &Share, _server: Option<&ShareServer>) -> Result<()> {
        let _call = self.begin("delete_share", &share.id).await?;
        if self.inventory.remove_share(&share.id).is_none() {
            debug!("{}: share {} already gone", self.name, share.id);
        }
        Ok(())
    }

    async fn extend_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self.begin("extend_share", &share.id).await?;
        self.inventory.extend(&share.id, new_size_gb)
    }

    async fn shrink_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self.begin("shrink_share", &share.id).await?;
        self.inventory.shrink(&share.id, new_size_gb)
    }

    async fn allow_access(
        &self,
        share: &Share,
        rule: &AccessRule,
        _server: Option<&ShareServer>,
    ) -> Result<Option<String>> {
        let _call = self.begin("allow_access", &share.id).await?;
        self.inventory.grant(
            &share.id,
            &rule.id,
            format!("{}:{}:{}", rule.access_type, rule.access_to, rule.access_level),
        )?;
        Ok(None)
    }

    async fn deny_access(
        &self,
        share: &Share,
        rule: &AccessRule,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self.begin("deny_access", &share.id).await?;
        self.inventory.revoke(&share.id, &rule.id)
    }

    async fn create_snapshot(
        &self,
        snapshot: &Snapshot,
        share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<Option<String>> {
        let _call = self.begin("create_snapshot", &share.id).await?;
        let location = format!("{}@{}", share.id, snapshot.id);
        self.inventory
            .add_snapshot(&snapshot.id, &share.id, location.clone())?;
        Ok(Some(location))
    }

    async fn delete_snapshot(
        &self,
        snapshot: &Snapshot,
        share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self.begin("delete_snapshot", &share.id).await?;
        self.inventory.remove_snapshot(&snapshot.id);
        Ok(())
    }

    async fn create_share_from_snapshot(
        &self,
        share: &Share,
        snapshot: &Snapshot,
        _server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        let _call = self.begin("create_share_from_snapshot", &share.id).await?;
        let source = self.inventory.snapshot(&snapshot.id).ok_or_else(|| {
            Error::DriverOperationFatal {
                backend: self.name.clone(),
                operation: "create_share_from_snapshot".into(),
                reason: format!("snapshot {} not found", snapshot.id),
            }
        })?;
        let pool = pool_of(&self.name, share.host.as_ref())?;
        let path = self.export_path(pool, &share.id);
        self.inventory
            .add_share_with_data(&share.id, pool, &path, share.size_gb, source.fingerprint)?;
        Ok(vec![ExportLocation::new(path)])
    }

    async fn manage_existing(
        &self,
        share: &Share,
        export_path: &str,
        _driver_options: &BTreeMap<String, String>,
    ) -> Result<ManagedShare> {
        let _call = self.begin("manage_existing", &share.id).await?;
        let adopted = self.inventory.adopt(export_path, &share.id)?;
        Ok(ManagedShare {
            size_gb: adopted.size_gb,
            export_locations: vec![ExportLocation::new(adopted.path)],
        })
    }

    async fn unmanage(&self, share: &Share) -> Result<()> {
        let _call = self.begin("unmanage", &share.id).await?;
        self.inventory.release(&share.id)
    }

    async fn setup_server(
        &self,
        network: &ShareNetwork,
        server_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        let _call = self.begin("setup_server", server_id).await?;
        let mut servers = self.servers.lock();
        let ip = format!("10.254.0.{}", 10 + servers.len());
        servers.insert(server_id.to_string(), ip.clone());

        let mut details = BTreeMap::new();
        details.insert("service_ip".to_string(), ip);
        details.insert("network".to_string(), network.name.clone());
        Ok(details)
    }

    async fn teardown_server(&self, server: &ShareServer) -> Result<()> {
        let _call = self.begin("teardown_server", &server.id).await?;
        self.servers.lock().remove(&server.id);
        Ok(())
    }

    async fn create_consistency_group(
        &self,
        cg: &ConsistencyGroup,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self.begin("create_consistency_group", &cg.id).await?;
        Ok(())
    }

    async fn delete_consistency_group(
        &self,
        cg: &ConsistencyGroup,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self.begin("delete_consistency_group", &cg.id).await?;
        Ok(())
    }

    async fn create_cgsnapshot(
        &self,
        cgsnapshot: &CgSnapshot,
        members: &[Share],
        _server: Option<&ShareServer>,
    ) -> Result<Vec<CgSnapshotMemberUpdate>> {
        let _call = self
            .begin("create_cgsnapshot", &cgsnapshot.consistency_group_id)
            .await?;

        let mut updates = Vec::new();
        for member in &cgsnapshot.members {
            let share = members
                .iter()
                .find(|s| s.id == member.share_id)
                .ok_or_else(|| Error::Internal(format!("member {} not passed", member.share_id)))?;
            let location = format!("{}@{}", share.id, cgsnapshot.id);
            self.inventory
                .add_snapshot(&member.id, &share.id, location.clone())?;
            updates.push(CgSnapshotMemberUpdate {
                member_id: member.id.clone(),
                provider_location: Some(location),
            });
        }

        if *self.partial_cgsnapshot.lock() {
            updates.pop();
        }
        Ok(updates)
    }

    async fn delete_cgsnapshot(
        &self,
        cgsnapshot: &CgSnapshot,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        let _call = self
            .begin("delete_cgsnapshot", &cgsnapshot.consistency_group_id)
            .await?;
        for member in &cgsnapshot.members {
            self.inventory.remove_snapshot(&member.id);
        }
        Ok(())
    }

    async fn create_replica(
        &self,
        ctx: ReplicationContext<'_>,
        new_replica: &Replica,
    ) -> Result<ReplicaUpdate> {
        let _call = self.begin("create_replica", &ctx.share.id).await?;
        let pool = pool_of(&self.name, Some(&new_replica.host))?;
        let path = self.export_path(pool, &new_replica.id);
        self.inventory
            .add_share(&new_replica.id, pool, &path, ctx.share.size_gb)?;
        self.pending_sync.lock().insert(new_replica.id.clone());
        Ok(ReplicaUpdate {
            export_locations: vec![ExportLocation::new(path)],
            replica_state: ReplicaState::OutOfSync,
        })
    }

    async fn delete_replica(&self, ctx: ReplicationContext<'_>, replica: &Replica) -> Result<()> {
        let _call = self.begin("delete_replica", &ctx.share.id).await?;
        self.pending_sync.lock().remove(&replica.id);
        self.inventory.remove_share(&replica.id);
        Ok(())
    }

    async fn promote_replica(
        &self,
        ctx: ReplicationContext<'_>,
        replica: &Replica,
    ) -> Result<Vec<ReplicaStateUpdate>> {
        let _call = self.begin("promote_replica", &ctx.share.id).await?;
        let mut updates = vec![ReplicaStateUpdate {
            replica_id: replica.id.clone(),
            replica_state: ReplicaState::Active,
        }];
        if let Some(previous) = ctx.active() {
            updates.push(ReplicaStateUpdate {
                replica_id: previous.id.clone(),
                replica_state: ReplicaState::InSync,
            });
        }
        Ok(updates)
    }

    async fn update_replica_state(
        &self,
        ctx: ReplicationContext<'_>,
        replica: &Replica,
    ) -> Result<ReplicaState> {
        let _call = self.begin("update_replica_state", &ctx.share.id).await?;
        self.pending_sync.lock().remove(&replica.id);
        Ok(ReplicaState::InSync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::domain::model::{new_id, PoolRef, ShareStatus};
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn driver() -> FakeDriver {
        let config = BackendConfig {
            pools: vec![PoolConfig {
                name: "pool0".into(),
                total_capacity_gb: 100,
            }],
            ..Default::default()
        };
        FakeDriver::new("fake1", &config, "nova")
    }

    fn share(size_gb: u64) -> Share {
        Share {
            id: new_id(),
            name: "s".into(),
            size_gb,
            protocol: ShareProtocol::Nfs,
            share_type: "default".into(),
            extra_specs: BTreeMap::new(),
            availability_zone: None,
            status: ShareStatus::Creating,
            status_reason: None,
            export_locations: vec![],
            snapshot_support: true,
            host: Some(PoolRef::new("fake1", "pool0")),
            share_network_id: None,
            share_server_id: None,
            consistency_group_id: None,
            snapshot_id: None,
            replication_type: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let driver = driver();
        let share = share(1);
        driver.inject_fault("create_share", Fault::Transient, 1);

        let err = driver.create_share(&share, None).await.unwrap_err();
        assert!(err.is_transient());

        let exports = driver.create_share(&share, None).await.unwrap();
        assert_eq!(exports[0].path, format!("fake1.fake:/pool0/share-{}", share.id));
        assert_eq!(driver.call_count("create_share"), 2);
    }

    #[tokio::test]
    async fn test_fatal_fault() {
        let driver = driver();
        driver.inject_fault("create_share", Fault::Fatal, 1);
        let err = driver.create_share(&share(1), None).await.unwrap_err();
        assert_matches!(err, Error::DriverOperationFatal { .. });
    }

    #[tokio::test]
    async fn test_stats_reflect_allocations() {
        let driver = driver();
        driver.create_share(&share(30), None).await.unwrap();

        let stats = driver.get_share_stats().await.unwrap();
        assert_eq!(stats.pools[0].free_capacity_gb, 70);
        assert_eq!(stats.pools[0].allocated_capacity_gb, 30);
    }

    #[tokio::test]
    async fn test_concurrency_tracking() {
        let driver = std::sync::Arc::new(driver());
        driver.set_delay(Duration::from_millis(20));
        let share = share(1);
        driver.create_share(&share, None).await.unwrap();

        let rule = |n: u8| AccessRule {
            id: new_id(),
            share_id: share.id.clone(),
            access_type: crate::domain::AccessType::Ip,
            access_to: format!("10.0.0.{}", n),
            access_level: crate::domain::AccessLevel::Rw,
            state: crate::domain::AccessState::New,
            access_key: None,
            created_at: Utc::now(),
        };
        let (a, b) = (rule(1), rule(2));
        let (r1, r2) = tokio::join!(
            driver.allow_access(&share, &a, None),
            driver.allow_access(&share, &b, None)
        );
        r1.unwrap();
        r2.unwrap();
        assert_eq!(driver.max_concurrency(&share.id), 2);
    }
}
