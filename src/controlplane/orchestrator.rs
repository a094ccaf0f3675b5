//! Main Orchestrator - The "Brain"
//!
//! Public entry point of the control plane. Validates requests, records
//! new entities, asks the scheduler for a pool and hands the work to the
//! share manager or one of the coordinators.
//!
//! Every lifecycle operation runs on its own spawned task. The caller
//! awaits the outcome, but dropping the caller's future leaves the task
//! running to completion; the entity's status can be polled meanwhile.

use crate::config::Config;
use crate::domain::model::{
    new_id, AccessLevel, AccessRule, AccessState, AccessType, CgSnapshot, CgSnapshotMember,
    ConsistencyGroup, ConsistencyGroupStatus, PoolRef, Replica, Share, ShareNetwork,
    ShareProtocol, ShareStatus, Snapshot, SnapshotStatus,
};
use crate::domain::ports::DriverRef;
use crate::domain::share_type::{normalize_extra_specs, ShareType};
use crate::drivers::{DriverFactory, DriverRegistry};
use crate::error::{Error, Result};
use crate::events::{EventBus, ShareEvent};
use crate::metrics::ControlPlaneMetrics;
use crate::scheduler::extra_specs_ops;
use crate::scheduler::{
    FilterScheduler, HostManager, PoolState, ReplicaPlacement, SchedulingRequest,
};
use crate::share::{
    access, ConsistencyCoordinator, DriverRetry, KeyedLocks, LifecycleContext,
    ReplicationCoordinator, ShareManager, ShareServerManager,
};
use crate::store::StateStore;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Requests
// =============================================================================

/// Scheduler hints naming other shares
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerHints {
    /// Place on the same backend as these shares
    #[serde(default)]
    pub same_host: Vec<String>,
    /// Keep off the backends of these shares
    #[serde(default)]
    pub different_host: Vec<String>,
}

/// Request to provision a share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShareRequest {
    pub name: String,
    pub size_gb: u64,
    pub protocol: ShareProtocol,
    /// Falls back to the configured default share type
    pub share_type: Option<String>,
    pub availability_zone: Option<String>,
    pub share_network_id: Option<String>,
    /// Create from this snapshot
    pub snapshot_id: Option<String>,
    pub consistency_group_id: Option<String>,
    #[serde(default)]
    pub scheduler_hints: SchedulerHints,
}

impl CreateShareRequest {
    pub fn new(name: impl Into<String>, size_gb: u64, protocol: ShareProtocol) -> Self {
        Self {
            name: name.into(),
            size_gb,
            protocol,
            share_type: None,
            availability_zone: None,
            share_network_id: None,
            snapshot_id: None,
            consistency_group_id: None,
            scheduler_hints: SchedulerHints::default(),
        }
    }
}

/// Request to take over an existing backend share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageShareRequest {
    pub name: String,
    pub host: PoolRef,
    pub export_path: String,
    pub protocol: ShareProtocol,
    pub share_type: Option<String>,
    #[serde(default)]
    pub driver_options: BTreeMap<String, String>,
}

/// Request to create a consistency group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConsistencyGroupRequest {
    pub name: String,
    /// Share types members may use; empty allows any
    #[serde(default)]
    pub share_types: Vec<String>,
    pub availability_zone: Option<String>,
    pub share_network_id: Option<String>,
}

/// Pool listing filter; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolQuery {
    pub backend: Option<String>,
    pub pool: Option<String>,
    /// Capability requirements using extra spec operators
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Orchestrator status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub healthy: bool,
    pub backends_health: BTreeMap<String, bool>,
    pub pool_count: u64,
    pub share_count: u64,
    pub snapshot_count: u64,
    /// Replica records, active copies included
    pub replica_count: u64,
    pub share_server_count: u64,
    pub consistency_group_count: u64,
    /// Capacity held by placements not yet confirmed
    pub pending_reservations_gb: u64,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Main orchestrator that coordinates all control plane operations
pub struct Orchestrator {
    config: Config,
    store: Arc<StateStore>,
    drivers: Arc<DriverRegistry>,
    hosts: Arc<HostManager>,
    scheduler: FilterScheduler,
    servers: Arc<ShareServerManager>,
    shares: Arc<ShareManager>,
    replication: Arc<ReplicationCoordinator>,
    consistency: Arc<ConsistencyCoordinator>,
    metrics: ControlPlaneMetrics,
    events: EventBus,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let store = StateStore::new();
        let drivers = DriverRegistry::new();
        let metrics = ControlPlaneMetrics::new()?;
        let events = EventBus::default();
        let hosts = Arc::new(HostManager::new(Duration::from_secs(
            config.capabilities.stale_after_secs,
        )));
        let scheduler = FilterScheduler::new(&config.scheduler, hosts.clone())?;
        let retry = DriverRetry::new(&config.manager, metrics.clone());
        let servers = Arc::new(ShareServerManager::new(
            store.clone(),
            drivers.clone(),
            retry.clone(),
            events.clone(),
            config.manager.clone(),
        ));

        let ctx = LifecycleContext {
            store: store.clone(),
            drivers: drivers.clone(),
            hosts: hosts.clone(),
            servers: servers.clone(),
            locks: Arc::new(KeyedLocks::new()),
            retry,
            events: events.clone(),
            metrics: metrics.clone(),
            config: config.manager.clone(),
        };

        Ok(Arc::new(Self {
            config,
            store,
            drivers,
            hosts,
            scheduler,
            servers,
            shares: Arc::new(ShareManager::new(ctx.clone())),
            replication: Arc::new(ReplicationCoordinator::new(ctx.clone())),
            consistency: Arc::new(ConsistencyCoordinator::new(ctx)),
            metrics,
            events,
        }))
    }

    /// Start the configured backends and load their capabilities
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing orchestrator");

        for (name, backend) in self.config.active_backends() {
            let zone = self.config.zone_of(backend);
            let driver = DriverFactory::create(name, backend, &zone)?;
            self.register_driver(driver).await?;
        }

        let refreshed = self.refresh_capabilities().await;
        info!(
            "Orchestrator initialized with {} backend(s), {} refreshed",
            self.drivers.len(),
            refreshed
        );
        Ok(())
    }

    /// Set up a driver and add it to the registry
    pub async fn register_driver(&self, driver: DriverRef) -> Result<()> {
        info!("Registering backend: {}", driver.backend_name());
        driver.do_setup().await?;
        self.drivers.register(driver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &ControlPlaneMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run lifecycle work on its own task and wait for the outcome
    async fn dispatch<T, F>(operation: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        match tokio::spawn(work).await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("{} task failed: {}", operation, e))),
        }
    }

    // =========================================================================
    // Capabilities & Pools
    // =========================================================================

    /// Pull stats from every backend; returns how many answered
    pub async fn refresh_capabilities(&self) -> usize {
        let drivers = self.drivers.all();
        let reports = join_all(drivers.iter().map(|d| d.get_share_stats())).await;

        let mut refreshed = 0;
        for (driver, report) in drivers.iter().zip(reports) {
            let backend = driver.backend_name().to_string();
            match report {
                Ok(stats) => {
                    let pools = self.hosts.update_from_stats(&stats);
                    debug!("Backend {} reported {} pool(s)", backend, pools);
                    self.events
                        .publish(ShareEvent::CapabilitiesRefreshed { backend, pools });
                    refreshed += 1;
                }
                Err(e) => warn!("Capability refresh for {} failed: {}", backend, e),
            }
        }
        for pool in self.hosts.all() {
            self.metrics
                .set_pool_free(&pool.host.to_string(), pool.available_gb() as f64);
        }
        refreshed
    }

    /// Known pools matching a query
    pub fn list_pools(&self, query: &PoolQuery) -> Vec<PoolState> {
        self.hosts
            .all()
            .into_iter()
            .filter(|p| query.backend.as_ref().map_or(true, |b| &p.host.backend == b))
            .filter(|p| query.pool.as_ref().map_or(true, |n| &p.host.pool == n))
            .filter(|p| {
                query.capabilities.iter().all(|(key, requirement)| {
                    extra_specs_ops::matches(p.capability(key).as_deref(), requirement)
                })
            })
            .collect()
    }

    // =========================================================================
    // Share Types
    // =========================================================================

    pub fn create_share_type(
        &self,
        name: &str,
        extra_specs: BTreeMap<String, String>,
    ) -> Result<ShareType> {
        if self.store.share_type_by_name(name).is_some() {
            return Err(Error::ResourceExists {
                kind: "ShareType".into(),
                name: name.to_string(),
            });
        }
        let share_type = ShareType::new(name, extra_specs)?;
        self.store.share_types.insert(share_type.clone())?;
        info!("Created share type {}", name);
        Ok(share_type)
    }

    /// Merge specs into a type; refused while shares use it unless forced
    pub fn update_share_type(
        &self,
        name: &str,
        extra_specs: BTreeMap<String, String>,
        force: bool,
    ) -> Result<ShareType> {
        let share_type = self.get_share_type(name)?;
        if !force && self.share_type_in_use(name) {
            return Err(Error::invalid_state(
                "ShareType",
                name,
                "extra specs are immutable while shares use the type",
            ));
        }
        let mut merged = share_type.extra_specs.clone();
        merged.extend(extra_specs);
        let merged = normalize_extra_specs(merged, true)?;
        self.store
            .share_types
            .modify(&share_type.id, |t| t.extra_specs = merged)
    }

    pub fn get_share_type(&self, name: &str) -> Result<ShareType> {
        self.store
            .share_type_by_name(name)
            .ok_or_else(|| Error::not_found("ShareType", name))
    }

    pub fn list_share_types(&self) -> Vec<ShareType> {
        self.store.share_types.list()
    }

    pub fn delete_share_type(&self, name: &str) -> Result<()> {
        let share_type = self.get_share_type(name)?;
        if self.share_type_in_use(name) {
            return Err(Error::invalid_state("ShareType", name, "share type is in use"));
        }
        self.store.share_types.remove(&share_type.id);
        Ok(())
    }

    fn share_type_in_use(&self, name: &str) -> bool {
        self.store.shares.find(|s| s.share_type == name).is_some()
            || self
                .store
                .consistency_groups
                .find(|c| c.share_types.iter().any(|t| t == name))
                .is_some()
    }

    /// Requested type or the configured default
    fn resolve_share_type(&self, name: Option<&str>) -> Result<ShareType> {
        let name = name
            .or(self.config.default_share_type.as_deref())
            .ok_or_else(|| {
                Error::InvalidShareType("no share type given and no default configured".into())
            })?;
        self.get_share_type(name)
    }

    // =========================================================================
    // Share Networks
    // =========================================================================

    pub fn create_share_network(&self, name: &str, cidr: Option<&str>) -> Result<ShareNetwork> {
        if let Some(cidr) = cidr {
            validate_cidr(cidr)?;
        }
        let network = ShareNetwork {
            id: new_id(),
            name: name.to_string(),
            cidr: cidr.map(String::from),
            created_at: Utc::now(),
        };
        self.store.share_networks.insert(network.clone())?;
        Ok(network)
    }

    pub fn get_share_network(&self, id: &str) -> Result<ShareNetwork> {
        self.store.share_networks.require(id)
    }

    pub fn list_share_networks(&self) -> Vec<ShareNetwork> {
        self.store.share_networks.list()
    }

    pub fn delete_share_network(&self, id: &str) -> Result<()> {
        self.store.share_networks.require(id)?;
        let used = self
            .store
            .shares
            .find(|s| s.share_network_id.as_deref() == Some(id))
            .is_some()
            || self
                .store
                .share_servers
                .find(|s| s.share_network_id == id)
                .is_some();
        if used {
            return Err(Error::invalid_state(
                "ShareNetwork",
                id,
                "network still has shares or share servers",
            ));
        }
        self.store.share_networks.remove(id);
        Ok(())
    }

    // =========================================================================
    // Shares
    // =========================================================================

    /// Provision a share: schedule, reserve, create, retrying elsewhere
    pub async fn create_share(self: &Arc<Self>, request: CreateShareRequest) -> Result<Share> {
        let share_type = self.resolve_share_type(request.share_type.as_deref())?;
        if request.size_gb == 0 {
            return Err(Error::InvalidRequest("share size must be at least 1 GiB".into()));
        }

        match (&request.share_network_id, share_type.dhss()) {
            (Some(network), true) => {
                self.store.share_networks.require(network)?;
            }
            (None, true) => {
                return Err(Error::InvalidRequest(format!(
                    "share type {} needs a share network",
                    share_type.name
                )))
            }
            (Some(_), false) => {
                return Err(Error::InvalidRequest(format!(
                    "share type {} does not use share networks",
                    share_type.name
                )))
            }
            (None, false) => {}
        }

        let mut scheduling = SchedulingRequest::new(request.size_gb);
        scheduling.protocol = Some(request.protocol);
        scheduling.extra_specs = share_type.extra_specs.clone();
        scheduling.availability_zone = request.availability_zone.clone();

        if let Some(snapshot_id) = &request.snapshot_id {
            let snapshot = self.store.snapshots.require(snapshot_id)?;
            if snapshot.status != SnapshotStatus::Available {
                return Err(Error::invalid_state(
                    "Snapshot",
                    snapshot_id,
                    "snapshot is not available",
                ));
            }
            if request.size_gb < snapshot.size_gb {
                return Err(Error::InvalidRequest(format!(
                    "share size {} is smaller than snapshot size {}",
                    request.size_gb, snapshot.size_gb
                )));
            }
            let parent = self.store.shares.require(&snapshot.share_id)?;
            scheduling.snapshot_host = parent.host.clone();
            if scheduling.availability_zone.is_none() {
                scheduling.availability_zone = parent.availability_zone.clone();
            }
        }

        if let Some(cg_id) = &request.consistency_group_id {
            let cg = self.store.consistency_groups.require(cg_id)?;
            if cg.status != ConsistencyGroupStatus::Available {
                return Err(Error::invalid_state(
                    "ConsistencyGroup",
                    cg_id,
                    "group is not available",
                ));
            }
            if !cg.share_types.is_empty() && !cg.share_types.contains(&share_type.name) {
                return Err(Error::InvalidRequest(format!(
                    "share type {} is not allowed in group {}",
                    share_type.name, cg_id
                )));
            }
            if cg.share_network_id != request.share_network_id {
                return Err(Error::InvalidRequest(
                    "share network must match the group's share network".into(),
                ));
            }
            scheduling.consistency_group_host = cg.host.clone();
        }

        scheduling.same_host = self.hosts_of(&request.scheduler_hints.same_host)?;
        scheduling.different_host = self.hosts_of(&request.scheduler_hints.different_host)?;

        let now = Utc::now();
        let share = Share {
            id: new_id(),
            name: request.name.clone(),
            size_gb: request.size_gb,
            protocol: request.protocol,
            share_type: share_type.name.clone(),
            extra_specs: share_type.extra_specs.clone(),
            availability_zone: request.availability_zone.clone(),
            status: ShareStatus::Creating,
            status_reason: None,
            export_locations: Vec::new(),
            snapshot_support: share_type.snapshot_support(),
            host: None,
            share_network_id: request.share_network_id.clone(),
            share_server_id: None,
            consistency_group_id: request.consistency_group_id.clone(),
            snapshot_id: request.snapshot_id.clone(),
            replication_type: share_type.replication_type(),
            created_at: now,
            updated_at: now,
        };
        self.store.shares.insert(share.clone())?;
        self.events
            .share_status(&share.id, ShareStatus::Creating, None);
        info!("Share {} ({} GiB {}) requested", share.id, share.size_gb, share.protocol);

        let this = self.clone();
        Self::dispatch("create_share", async move {
            this.place_share(&share.id, scheduling).await
        })
        .await
    }

    async fn place_share(&self, share_id: &str, mut request: SchedulingRequest) -> Result<Share> {
        let attempts = self.config.scheduler.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let final_attempt = attempt >= attempts;
            let reservation = match self.scheduler.select_and_reserve(&request) {
                Ok(reservation) => reservation,
                Err(e) => {
                    self.metrics.inc_scheduling_failure();
                    error!("Scheduling share {} failed: {}", share_id, e);
                    self.store.shares.modify(share_id, |s| {
                        s.host = None;
                        s.set_status(ShareStatus::Error, Some(e.to_string()));
                    })?;
                    self.events
                        .share_status(share_id, ShareStatus::Error, Some(e.to_string()));
                    return Err(e);
                }
            };

            let zone = self
                .hosts
                .get(&reservation.host)
                .map(|p| p.availability_zone);
            self.store.shares.modify(share_id, |s| {
                s.host = Some(reservation.host.clone());
                if zone.is_some() {
                    s.availability_zone = zone;
                }
            })?;

            match self.shares.create_share(share_id, final_attempt).await {
                Ok(share) => {
                    self.hosts.confirm(&reservation);
                    return Ok(share);
                }
                Err(e) => {
                    self.hosts.rollback(&reservation);
                    if final_attempt {
                        return Err(e);
                    }
                    warn!(
                        "Attempt {} for share {} on {} failed, rescheduling: {}",
                        attempt, share_id, reservation.host, e
                    );
                    request.tried_hosts.push(reservation.host.clone());
                    self.store.shares.modify(share_id, |s| s.host = None)?;
                    attempt += 1;
                }
            }
        }
    }

    fn hosts_of(&self, share_ids: &[String]) -> Result<Vec<PoolRef>> {
        share_ids
            .iter()
            .map(|id| {
                let share = self.store.shares.require(id)?;
                Ok(share.require_host()?.clone())
            })
            .collect()
    }

    pub fn get_share(&self, share_id: &str) -> Result<Share> {
        self.store.shares.require(share_id)
    }

    pub fn list_shares(&self) -> Vec<Share> {
        self.store.shares.list()
    }

    pub async fn delete_share(&self, share_id: &str) -> Result<()> {
        let shares = self.shares.clone();
        let id = share_id.to_string();
        Self::dispatch("delete_share", async move { shares.delete_share(&id).await }).await
    }

    pub async fn extend_share(&self, share_id: &str, new_size_gb: u64) -> Result<Share> {
        let shares = self.shares.clone();
        let id = share_id.to_string();
        Self::dispatch("extend_share", async move {
            shares.extend_share(&id, new_size_gb).await
        })
        .await
    }

    pub async fn shrink_share(&self, share_id: &str, new_size_gb: u64) -> Result<Share> {
        let shares = self.shares.clone();
        let id = share_id.to_string();
        Self::dispatch("shrink_share", async move {
            shares.shrink_share(&id, new_size_gb).await
        })
        .await
    }

    /// Take over an existing share on a known pool
    pub async fn manage_share(&self, request: ManageShareRequest) -> Result<Share> {
        let share_type = self.resolve_share_type(request.share_type.as_deref())?;
        if share_type.dhss() {
            return Err(Error::InvalidRequest(format!(
                "share type {} handles share servers; manage is not supported",
                share_type.name
            )));
        }
        let pool = self
            .hosts
            .get(&request.host)
            .ok_or_else(|| Error::not_found("Pool", request.host.to_string()))?;
        if request.export_path.trim().is_empty() {
            return Err(Error::InvalidRequest("export path is empty".into()));
        }

        let now = Utc::now();
        let share = Share {
            id: new_id(),
            name: request.name.clone(),
            size_gb: 0,
            protocol: request.protocol,
            share_type: share_type.name.clone(),
            extra_specs: share_type.extra_specs.clone(),
            availability_zone: Some(pool.availability_zone.clone()),
            status: ShareStatus::Managing,
            status_reason: None,
            export_locations: Vec::new(),
            snapshot_support: share_type.snapshot_support(),
            host: Some(request.host.clone()),
            share_network_id: None,
            share_server_id: None,
            consistency_group_id: None,
            snapshot_id: None,
            replication_type: None,
            created_at: now,
            updated_at: now,
        };
        self.store.shares.insert(share.clone())?;

        let shares = self.shares.clone();
        Self::dispatch("manage_share", async move {
            shares
                .manage_share(&share.id, &request.export_path, &request.driver_options)
                .await
        })
        .await
    }

    pub async fn unmanage_share(&self, share_id: &str) -> Result<()> {
        let shares = self.shares.clone();
        let id = share_id.to_string();
        Self::dispatch("unmanage_share", async move { shares.unmanage_share(&id).await }).await
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn create_snapshot(&self, share_id: &str, name: &str) -> Result<Snapshot> {
        let share = self.store.shares.require(share_id)?;
        if !share.snapshot_support {
            return Err(Error::InvalidRequest(format!(
                "share type {} does not support snapshots",
                share.share_type
            )));
        }
        if share.status != ShareStatus::Available {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                format!("cannot snapshot a share in status {}", share.status),
            ));
        }

        let now = Utc::now();
        let snapshot = Snapshot {
            id: new_id(),
            share_id: share_id.to_string(),
            name: name.to_string(),
            size_gb: share.size_gb,
            status: SnapshotStatus::Creating,
            status_reason: None,
            provider_location: None,
            created_at: now,
            updated_at: now,
        };
        self.store.snapshots.insert(snapshot.clone())?;

        let shares = self.shares.clone();
        Self::dispatch("create_snapshot", async move {
            shares.create_snapshot(&snapshot.id).await
        })
        .await
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.store.snapshots.require(snapshot_id)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let shares = self.shares.clone();
        let id = snapshot_id.to_string();
        Self::dispatch("delete_snapshot", async move { shares.delete_snapshot(&id).await }).await
    }

    // =========================================================================
    // Access Rules
    // =========================================================================

    /// Grant access; the returned rule is `active` or `error`
    pub async fn allow_access(
        &self,
        share_id: &str,
        access_type: AccessType,
        access_to: &str,
        access_level: AccessLevel,
    ) -> Result<AccessRule> {
        let share = self.store.shares.require(share_id)?;
        let existing = self.store.access_rules_of(share_id);
        access::validate(share.protocol, access_type, access_to, &existing)?;

        let rule = AccessRule {
            id: new_id(),
            share_id: share_id.to_string(),
            access_type,
            access_to: access_to.trim().to_string(),
            access_level,
            state: AccessState::New,
            access_key: None,
            created_at: Utc::now(),
        };
        self.store.access_rules.insert(rule.clone())?;

        let shares = self.shares.clone();
        let rule_id = rule.id.clone();
        Self::dispatch("allow_access", async move { shares.allow_access(&rule_id).await })
            .await?;
        self.store.access_rules.require(&rule.id)
    }

    pub async fn deny_access(&self, rule_id: &str) -> Result<()> {
        let shares = self.shares.clone();
        let id = rule_id.to_string();
        Self::dispatch("deny_access", async move { shares.deny_access(&id).await }).await
    }

    pub fn list_access_rules(&self, share_id: &str) -> Vec<AccessRule> {
        self.store.access_rules_of(share_id)
    }

    // =========================================================================
    // Replicas
    // =========================================================================

    /// Add a replica on a pool in the active replica's replication domain
    pub async fn create_replica(
        &self,
        share_id: &str,
        availability_zone: Option<String>,
    ) -> Result<Replica> {
        let share = self.store.shares.require(share_id)?;
        if share.replication_type.is_none() {
            return Err(Error::InvalidRequest(format!(
                "share {} has a share type without replication",
                share_id
            )));
        }
        if share.status != ShareStatus::Available {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                format!("cannot replicate a share in status {}", share.status),
            ));
        }

        let replicas = self.store.replicas_of(share_id);
        let active = replicas
            .iter()
            .find(|r| r.is_active())
            .ok_or_else(|| {
                Error::Replication(format!("share {} has no active replica", share_id))
            })?;
        let domain = self
            .hosts
            .get(&active.host)
            .and_then(|p| p.replication_domain)
            .ok_or_else(|| {
                Error::Replication(format!(
                    "backend {} has no replication domain",
                    active.host.backend
                ))
            })?;

        let mut scheduling = SchedulingRequest::new(share.size_gb);
        scheduling.protocol = Some(share.protocol);
        scheduling.extra_specs = share.extra_specs.clone();
        scheduling.availability_zone = availability_zone.clone();
        scheduling.replication = Some(ReplicaPlacement {
            domain: Some(domain),
            existing_hosts: replicas.iter().map(|r| r.host.clone()).collect(),
        });

        let reservation = self.scheduler.select_and_reserve(&scheduling).map_err(|e| {
            self.metrics.inc_scheduling_failure();
            e
        })?;
        let zone = availability_zone.or_else(|| {
            self.hosts
                .get(&reservation.host)
                .map(|p| p.availability_zone)
        });
        let replica = ReplicationCoordinator::new_replica(share_id, reservation.host.clone(), zone);
        if let Err(e) = self.store.replicas.insert(replica.clone()) {
            self.hosts.rollback(&reservation);
            return Err(e);
        }

        let replication = self.replication.clone();
        let hosts = self.hosts.clone();
        Self::dispatch("create_replica", async move {
            let result = replication.create_replica(&replica.id).await;
            match &result {
                Ok(_) => hosts.confirm(&reservation),
                Err(_) => hosts.rollback(&reservation),
            }
            result
        })
        .await
    }

    pub async fn promote_replica(&self, replica_id: &str, force: bool) -> Result<Replica> {
        let replication = self.replication.clone();
        let id = replica_id.to_string();
        Self::dispatch("promote_replica", async move {
            replication.promote_replica(&id, force).await
        })
        .await
    }

    pub async fn update_replica(&self, replica_id: &str) -> Result<Replica> {
        let replication = self.replication.clone();
        let id = replica_id.to_string();
        Self::dispatch("update_replica", async move { replication.update_replica(&id).await })
            .await
    }

    pub async fn delete_replica(&self, replica_id: &str, force: bool) -> Result<()> {
        let replication = self.replication.clone();
        let id = replica_id.to_string();
        Self::dispatch("delete_replica", async move {
            replication.delete_replica(&id, force).await
        })
        .await
    }

    pub fn list_replicas(&self, share_id: &str) -> Vec<Replica> {
        self.store.replicas_of(share_id)
    }

    // =========================================================================
    // Consistency Groups
    // =========================================================================

    /// Create a group on a pool every allowed share type can use
    pub async fn create_consistency_group(
        &self,
        request: CreateConsistencyGroupRequest,
    ) -> Result<ConsistencyGroup> {
        let types = request
            .share_types
            .iter()
            .map(|name| self.get_share_type(name))
            .collect::<Result<Vec<_>>>()?;
        let dhss: BTreeSet<bool> = types.iter().map(|t| t.dhss()).collect();
        if dhss.len() > 1 {
            return Err(Error::InvalidRequest(
                "share types of a group must agree on driver_handles_share_servers".into(),
            ));
        }
        let dhss = dhss.into_iter().next().unwrap_or(request.share_network_id.is_some());
        match (&request.share_network_id, dhss) {
            (Some(network), true) => {
                self.store.share_networks.require(network)?;
            }
            (None, false) => {}
            _ => {
                return Err(Error::InvalidRequest(
                    "a share network is required exactly when share types handle share servers"
                        .into(),
                ))
            }
        }

        let host = self.select_group_host(&types, request.availability_zone.as_deref())?;
        let zone = self.hosts.get(&host).map(|p| p.availability_zone);
        let cg = ConsistencyGroup {
            id: new_id(),
            name: request.name.clone(),
            share_types: request.share_types.clone(),
            host: Some(host),
            availability_zone: zone,
            share_network_id: request.share_network_id.clone(),
            share_server_id: None,
            status: ConsistencyGroupStatus::Creating,
            status_reason: None,
            created_at: Utc::now(),
        };
        self.store.consistency_groups.insert(cg.clone())?;

        let consistency = self.consistency.clone();
        Self::dispatch("create_consistency_group", async move {
            consistency.create_group(&cg.id).await
        })
        .await
    }

    /// Best pool passing the filters for every share type
    fn select_group_host(&self, types: &[ShareType], zone: Option<&str>) -> Result<PoolRef> {
        let request_for = |specs: BTreeMap<String, String>| {
            let mut request = SchedulingRequest::new(0);
            request.require_cg_support = true;
            request.extra_specs = specs;
            request.availability_zone = zone.map(String::from);
            request
        };

        let candidates = match types.split_first() {
            None => self.scheduler.candidates(&request_for(BTreeMap::new()))?,
            Some((first, rest)) => {
                let mut candidates = self
                    .scheduler
                    .candidates(&request_for(first.extra_specs.clone()))?;
                for share_type in rest {
                    let allowed: Vec<PoolRef> = self
                        .scheduler
                        .candidates(&request_for(share_type.extra_specs.clone()))?
                        .into_iter()
                        .map(|w| w.pool.host)
                        .collect();
                    candidates.retain(|w| allowed.contains(&w.pool.host));
                }
                candidates
            }
        };

        candidates
            .into_iter()
            .next()
            .map(|w| w.pool.host)
            .ok_or_else(|| {
                self.metrics.inc_scheduling_failure();
                Error::NoValidHost {
                    reason: "no pool supports every share type of the group".into(),
                }
            })
    }

    pub fn get_consistency_group(&self, cg_id: &str) -> Result<ConsistencyGroup> {
        self.store.consistency_groups.require(cg_id)
    }

    pub async fn delete_consistency_group(&self, cg_id: &str) -> Result<()> {
        let consistency = self.consistency.clone();
        let id = cg_id.to_string();
        Self::dispatch("delete_consistency_group", async move {
            consistency.delete_group(&id).await
        })
        .await
    }

    /// Snapshot every current member of a group
    pub async fn create_cgsnapshot(&self, cg_id: &str, name: &str) -> Result<CgSnapshot> {
        let cg = self.store.consistency_groups.require(cg_id)?;
        if cg.status != ConsistencyGroupStatus::Available {
            return Err(Error::invalid_state(
                "ConsistencyGroup",
                cg_id,
                "group is not available",
            ));
        }

        let members = self.store.members_of(cg_id);
        let cgsnapshot = CgSnapshot {
            id: new_id(),
            consistency_group_id: cg_id.to_string(),
            name: name.to_string(),
            status: SnapshotStatus::Creating,
            status_reason: None,
            members: members
                .iter()
                .map(|share| CgSnapshotMember {
                    id: new_id(),
                    share_id: share.id.clone(),
                    size_gb: share.size_gb,
                    status: SnapshotStatus::Creating,
                    provider_location: None,
                })
                .collect(),
            created_at: Utc::now(),
        };
        self.store.cgsnapshots.insert(cgsnapshot.clone())?;

        let consistency = self.consistency.clone();
        Self::dispatch("create_cgsnapshot", async move {
            consistency.create_cgsnapshot(&cgsnapshot.id).await
        })
        .await
    }

    pub fn get_cgsnapshot(&self, cgsnapshot_id: &str) -> Result<CgSnapshot> {
        self.store.cgsnapshots.require(cgsnapshot_id)
    }

    pub async fn delete_cgsnapshot(&self, cgsnapshot_id: &str) -> Result<()> {
        let consistency = self.consistency.clone();
        let id = cgsnapshot_id.to_string();
        Self::dispatch("delete_cgsnapshot", async move {
            consistency.delete_cgsnapshot(&id).await
        })
        .await
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Start the periodic tasks; they stop when `shutdown` is cancelled
    pub fn start_background(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            self.periodic(
                "capability refresh",
                Duration::from_secs(self.config.capabilities.refresh_interval_secs),
                shutdown.clone(),
                |this| async move {
                    this.refresh_capabilities().await;
                },
            ),
            self.periodic(
                "replica state poll",
                Duration::from_secs(self.config.replication.replica_state_update_interval_secs),
                shutdown.clone(),
                |this| async move {
                    let updated = this.replication.poll_all().await;
                    debug!("Polled {} replica(s)", updated);
                },
            ),
        ];

        if self.config.manager.automatic_share_server_cleanup {
            let age = self.config.manager.unused_server_age();
            tasks.push(self.periodic("share server cleanup", age, shutdown, move |this| {
                async move {
                    let removed = this.servers.cleanup_unused(age).await;
                    if removed > 0 {
                        info!("Removed {} unused share server(s)", removed);
                    }
                }
            }));
        }
        tasks
    }

    fn periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        every: Duration,
        shutdown: CancellationToken,
        work: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Stopping {}", name);
                        break;
                    }
                    _ = ticker.tick() => work(this.clone()).await,
                }
            }
        })
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Get backend health status
    pub async fn backends_health(&self) -> BTreeMap<String, bool> {
        let drivers = self.drivers.all();
        let probes = join_all(drivers.iter().map(|d| d.health_check())).await;
        drivers
            .iter()
            .zip(probes)
            .map(|(d, ok)| (d.backend_name().to_string(), ok.unwrap_or(false)))
            .collect()
    }

    /// Get overall orchestrator status
    pub async fn status(&self) -> OrchestratorStatus {
        let backends_health = self.backends_health().await;
        OrchestratorStatus {
            healthy: backends_health.values().all(|&h| h),
            backends_health,
            pool_count: self.hosts.len() as u64,
            share_count: self.store.shares.len() as u64,
            snapshot_count: self.store.snapshots.len() as u64,
            replica_count: self.store.replicas.len() as u64,
            share_server_count: self.store.share_servers.len() as u64,
            consistency_group_count: self.store.consistency_groups.len() as u64,
            pending_reservations_gb: self.hosts.pending_total(),
        }
    }
}

/// `address/prefix` with a prefix that fits the address family
fn validate_cidr(cidr: &str) -> Result<()> {
    let invalid = || Error::InvalidRequest(format!("invalid CIDR '{}'", cidr));
    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let address: std::net::IpAddr = address.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, PoolConfig};
    use crate::domain::model::ReplicaState;
    use crate::drivers::{FakeDriver, Fault};
    use assert_matches::assert_matches;

    fn specs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.manager.driver_retry_initial_interval_ms = 1;
        config.manager.driver_retry_max_interval_ms = 2;
        config
    }

    async fn with_fake(domain: Option<&str>) -> (Arc<Orchestrator>, Arc<FakeDriver>) {
        let orchestrator = Orchestrator::new(fast_config()).unwrap();
        let backend = BackendConfig {
            replication_domain: domain.map(String::from),
            pools: vec![
                PoolConfig {
                    name: "p1".into(),
                    total_capacity_gb: 100,
                },
                PoolConfig {
                    name: "p2".into(),
                    total_capacity_gb: 100,
                },
            ],
            ..Default::default()
        };
        let driver = Arc::new(FakeDriver::new("fake1", &backend, "nova"));
        orchestrator.register_driver(driver.clone()).await.unwrap();
        assert_eq!(orchestrator.refresh_capabilities().await, 1);
        (orchestrator, driver)
    }

    #[tokio::test]
    async fn test_cephfs_share_scenario() {
        let config = Config::from_yaml(
            r#"
backends:
  cephfs1:
    driver: cephfs
    pools:
      - name: cephfs
        total_capacity_gb: 10
    options:
      mon_addrs: "10.0.0.1:6789,10.0.0.2:6789"
"#,
        )
        .unwrap();
        let orchestrator = Orchestrator::new(config).unwrap();
        orchestrator.initialize().await.unwrap();
        orchestrator
            .create_share_type("cephfstype", specs(&[("driver_handles_share_servers", "False")]))
            .unwrap();

        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Cephfs);
        request.share_type = Some("cephfstype".into());
        let share = orchestrator.create_share(request).await.unwrap();

        assert_eq!(share.status, ShareStatus::Available);
        assert_eq!(share.host, Some(PoolRef::new("cephfs1", "cephfs")));
        assert_eq!(
            share.export_locations[0].path,
            format!("10.0.0.1:6789,10.0.0.2:6789:/volumes/_nogroup/{}", share.id)
        );
        assert_eq!(orchestrator.hosts.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_retry_on_another_pool_after_failure() {
        let (orchestrator, driver) = with_fake(None).await;
        orchestrator
            .create_share_type("default", specs(&[("driver_handles_share_servers", "False")]))
            .unwrap();
        driver.inject_fault("create_share", Fault::Fatal, 1);

        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("default".into());
        let share = orchestrator.create_share(request).await.unwrap();

        assert_eq!(share.status, ShareStatus::Available);
        assert_eq!(driver.call_count("create_share"), 2);
        assert_eq!(orchestrator.hosts.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_no_valid_host_sets_error() {
        let (orchestrator, _) = with_fake(None).await;
        orchestrator
            .create_share_type("default", specs(&[("driver_handles_share_servers", "False")]))
            .unwrap();

        let mut request = CreateShareRequest::new("huge", 500, ShareProtocol::Nfs);
        request.share_type = Some("default".into());
        assert_matches!(
            orchestrator.create_share(request).await,
            Err(Error::NoValidHost { .. })
        );
        let shares = orchestrator.list_shares();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].status, ShareStatus::Error);
        assert!(shares[0].status_reason.is_some());
    }

    #[tokio::test]
    async fn test_promote_out_of_sync_without_force() {
        let (orchestrator, _) = with_fake(Some("east")).await;
        orchestrator
            .create_share_type(
                "replicated",
                specs(&[
                    ("driver_handles_share_servers", "False"),
                    ("replication_type", "readable"),
                ]),
            )
            .unwrap();
        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("replicated".into());
        let share = orchestrator.create_share(request).await.unwrap();

        let replica = orchestrator.create_replica(&share.id, None).await.unwrap();
        assert_eq!(replica.replica_state, ReplicaState::OutOfSync);
        assert_ne!(Some(replica.host.clone()), share.host);

        assert_matches!(
            orchestrator.promote_replica(&replica.id, false).await,
            Err(Error::ReplicationPromotion { .. })
        );
        let replicas = orchestrator.list_replicas(&share.id);
        assert_eq!(replicas.iter().filter(|r| r.is_active()).count(), 1);
        assert_eq!(replicas[0].id, share.id);
        assert_eq!(
            orchestrator.store.replicas.require(&replica.id).unwrap().replica_state,
            ReplicaState::OutOfSync
        );
        assert_eq!(orchestrator.status().await.replica_count, 2);
    }

    #[tokio::test]
    async fn test_sole_replica_delete_refused() {
        let (orchestrator, _) = with_fake(Some("east")).await;
        orchestrator
            .create_share_type(
                "replicated",
                specs(&[
                    ("driver_handles_share_servers", "False"),
                    ("replication_type", "readable"),
                ]),
            )
            .unwrap();
        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("replicated".into());
        let share = orchestrator.create_share(request).await.unwrap();

        assert_matches!(
            orchestrator.delete_replica(&share.id, false).await,
            Err(Error::InvalidState { .. })
        );
        let replicas = orchestrator.list_replicas(&share.id);
        assert_eq!(replicas.len(), 1);
        assert!(replicas[0].is_active());
    }

    #[tokio::test]
    async fn test_cgsnapshot_partial_failure() {
        let (orchestrator, driver) = with_fake(None).await;
        orchestrator
            .create_share_type("default", specs(&[("driver_handles_share_servers", "False")]))
            .unwrap();
        let cg = orchestrator
            .create_consistency_group(CreateConsistencyGroupRequest {
                name: "cg".into(),
                share_types: vec!["default".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(cg.status, ConsistencyGroupStatus::Available);

        for name in ["a", "b"] {
            let mut request = CreateShareRequest::new(name, 1, ShareProtocol::Nfs);
            request.share_type = Some("default".into());
            request.consistency_group_id = Some(cg.id.clone());
            let share = orchestrator.create_share(request).await.unwrap();
            assert_eq!(share.host, cg.host);
        }

        driver.set_partial_cgsnapshot(true);
        assert_matches!(
            orchestrator.create_cgsnapshot(&cg.id, "snap").await,
            Err(Error::ConsistencyGroupPartialFailure { .. })
        );
        let cgsnapshot = orchestrator.store.cgsnapshots.list().remove(0);
        assert_eq!(cgsnapshot.status, SnapshotStatus::Error);
        assert!(cgsnapshot
            .members
            .iter()
            .all(|m| m.status == SnapshotStatus::Error));
    }

    #[tokio::test]
    async fn test_access_rule_validation() {
        let (orchestrator, _) = with_fake(None).await;
        orchestrator
            .create_share_type("default", specs(&[("driver_handles_share_servers", "False")]))
            .unwrap();
        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("default".into());
        let share = orchestrator.create_share(request).await.unwrap();

        let rule = orchestrator
            .allow_access(&share.id, AccessType::Ip, "10.0.0.0/24", AccessLevel::Rw)
            .await
            .unwrap();
        assert_eq!(rule.state, AccessState::Active);
        assert_matches!(
            orchestrator
                .allow_access(&share.id, AccessType::Ip, "10.0.0.0/24", AccessLevel::Ro)
                .await,
            Err(Error::AccessRuleExists { .. })
        );
        assert_matches!(
            orchestrator
                .allow_access(&share.id, AccessType::Cephx, "alice", AccessLevel::Rw)
                .await,
            Err(Error::InvalidShareAccess(_))
        );
    }

    #[tokio::test]
    async fn test_share_type_immutable_while_used() {
        let (orchestrator, _) = with_fake(None).await;
        orchestrator
            .create_share_type("default", specs(&[("driver_handles_share_servers", "False")]))
            .unwrap();
        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("default".into());
        orchestrator.create_share(request).await.unwrap();

        let change = specs(&[("snapshot_support", "False")]);
        assert_matches!(
            orchestrator.update_share_type("default", change.clone(), false),
            Err(Error::InvalidState { .. })
        );
        let updated = orchestrator.update_share_type("default", change, true).unwrap();
        assert_eq!(updated.extra_specs["snapshot_support"], "False");
        assert_matches!(
            orchestrator.delete_share_type("default"),
            Err(Error::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn test_list_pools_and_status() {
        let (orchestrator, _) = with_fake(Some("east")).await;
        assert_eq!(orchestrator.list_pools(&PoolQuery::default()).len(), 2);

        let query = PoolQuery {
            pool: Some("p2".into()),
            capabilities: specs(&[("replication_domain", "east")]),
            ..Default::default()
        };
        let pools = orchestrator.list_pools(&query);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].host, PoolRef::new("fake1", "p2"));

        let status = orchestrator.status().await;
        assert!(status.healthy);
        assert_eq!(status.pool_count, 2);
        assert_eq!(status.share_count, 0);
    }

    #[tokio::test]
    async fn test_dhss_requires_network() {
        let (orchestrator, _) = with_fake(None).await;
        orchestrator
            .create_share_type("dhss", specs(&[("driver_handles_share_servers", "True")]))
            .unwrap();
        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("dhss".into());
        assert_matches!(
            orchestrator.create_share(request).await,
            Err(Error::InvalidRequest(_))
        );
        assert!(orchestrator.list_shares().is_empty());
    }

    #[tokio::test]
    async fn test_failed_server_setup_frees_network() {
        let orchestrator = Orchestrator::new(fast_config()).unwrap();
        let backend = BackendConfig {
            driver_handles_share_servers: true,
            pools: vec![PoolConfig {
                name: "p1".into(),
                total_capacity_gb: 100,
            }],
            ..Default::default()
        };
        let driver = Arc::new(FakeDriver::new("fake1", &backend, "nova"));
        orchestrator.register_driver(driver.clone()).await.unwrap();
        orchestrator.refresh_capabilities().await;
        orchestrator
            .create_share_type("dhss", specs(&[("driver_handles_share_servers", "True")]))
            .unwrap();
        let network = orchestrator
            .create_share_network("tenant", Some("10.10.0.0/24"))
            .unwrap();

        driver.inject_fault("setup_server", Fault::Fatal, 1);
        let mut request = CreateShareRequest::new("s1", 1, ShareProtocol::Nfs);
        request.share_type = Some("dhss".into());
        request.share_network_id = Some(network.id.clone());
        assert!(orchestrator.create_share(request).await.is_err());
        assert_eq!(orchestrator.store().share_servers.len(), 0);

        let share = orchestrator.list_shares().remove(0);
        assert_eq!(share.status, ShareStatus::Error);
        orchestrator.delete_share(&share.id).await.unwrap();
        orchestrator.delete_share_network(&network.id).unwrap();
        assert!(orchestrator.list_share_networks().is_empty());
    }

    #[test]
    fn test_validate_cidr() {
        assert!(validate_cidr("10.0.0.0/24").is_ok());
        assert!(validate_cidr("fd00::/64").is_ok());
        assert!(validate_cidr("10.0.0.0/33").is_err());
        assert!(validate_cidr("10.0.0.0").is_err());
    }
}
