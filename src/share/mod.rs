//! Share Lifecycle
//!
//! Components that drive shares and their dependents through their state
//! machines by calling drivers:
//! - Share manager: shares, snapshots, access rules, manage/unmanage
//! - Share server manager: reference counted per-network endpoints
//! - Replication coordinator: replica creation, polling, promotion
//! - Consistency group coordinator: groups and atomic group snapshots
//!
//! Every operation on a share holds that share's lock for its whole
//! duration and moves the status with a compare-and-swap on the store.

pub mod access;
pub mod consistency;
pub mod locks;
pub mod manager;
pub mod replication;
pub mod retry;
pub mod server;

pub use consistency::ConsistencyCoordinator;
pub use locks::KeyedLocks;
pub use manager::ShareManager;
pub use replication::ReplicationCoordinator;
pub use retry::DriverRetry;
pub use server::ShareServerManager;

use crate::config::ManagerConfig;
use crate::domain::model::{Share, ShareServer};
use crate::drivers::DriverRegistry;
use crate::error::Result;
use crate::events::EventBus;
use crate::metrics::ControlPlaneMetrics;
use crate::scheduler::HostManager;
use crate::store::StateStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Handles shared by the lifecycle components
#[derive(Clone)]
pub struct LifecycleContext {
    pub store: Arc<StateStore>,
    pub drivers: Arc<DriverRegistry>,
    pub hosts: Arc<HostManager>,
    pub servers: Arc<ShareServerManager>,
    /// Per-share locks
    pub locks: Arc<KeyedLocks>,
    pub retry: DriverRetry,
    pub events: EventBus,
    pub metrics: ControlPlaneMetrics,
    pub config: ManagerConfig,
}

impl LifecycleContext {
    /// Share as the driver should see it
    ///
    /// A replicated share's data lives under its active replica, which
    /// takes over the share's identity on the backend after a promotion.
    pub fn driver_view(&self, share: &Share) -> Share {
        if share.replication_type.is_none() {
            return share.clone();
        }
        let mut view = share.clone();
        if let Some(active) = self
            .store
            .replicas
            .find(|r| r.share_id == share.id && r.is_active())
        {
            view.id = active.id;
            view.host = Some(active.host);
        }
        view
    }

    /// Share server a share or group was placed on
    pub fn server_of(&self, server_id: Option<&str>) -> Result<Option<ShareServer>> {
        server_id
            .map(|id| self.store.share_servers.require(id))
            .transpose()
    }

    /// Record duration and outcome of an operation
    pub async fn observed<T, F>(&self, operation: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = work.await;
        self.metrics
            .observe_operation(operation, result.is_ok(), started.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the lifecycle tests

    use super::*;
    use crate::config::{BackendConfig, DriverKind, PoolConfig};
    use crate::domain::model::{new_id, PoolRef, ShareProtocol, ShareStatus};
    use crate::drivers::FakeDriver;
    use crate::domain::ShareDriver;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) fn backend(domain: Option<&str>) -> BackendConfig {
        BackendConfig {
            driver: DriverKind::Fake,
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
        }
    }

    pub(crate) struct Harness {
        pub ctx: LifecycleContext,
        pub driver: Arc<FakeDriver>,
    }

    pub(crate) async fn harness(config: BackendConfig) -> Harness {
        let driver = Arc::new(FakeDriver::new("b1", &config, "nova"));
        let drivers = DriverRegistry::new();
        drivers.register(driver.clone()).unwrap();

        let manager = ManagerConfig {
            driver_retry_initial_interval_ms: 1,
            driver_retry_max_interval_ms: 2,
            ..Default::default()
        };
        let metrics = ControlPlaneMetrics::new().unwrap();
        let retry = DriverRetry::new(&manager, metrics.clone());
        let store = StateStore::new();
        let events = EventBus::default();
        let hosts = Arc::new(HostManager::new(Duration::from_secs(600)));
        hosts.update_from_stats(&driver.get_share_stats().await.unwrap());
        let servers = Arc::new(ShareServerManager::new(
            store.clone(),
            drivers.clone(),
            retry.clone(),
            events.clone(),
            manager.clone(),
        ));

        Harness {
            ctx: LifecycleContext {
                store,
                drivers,
                hosts,
                servers,
                locks: Arc::new(KeyedLocks::new()),
                retry,
                events,
                metrics,
                config: manager,
            },
            driver,
        }
    }

    /// A share record placed on `b1#pool`, not yet created
    pub(crate) fn placed_share(pool: &str, size_gb: u64) -> Share {
        Share {
            id: new_id(),
            name: "share".into(),
            size_gb,
            protocol: ShareProtocol::Nfs,
            share_type: "default".into(),
            extra_specs: BTreeMap::new(),
            availability_zone: Some("nova".into()),
            status: ShareStatus::Creating,
            status_reason: None,
            export_locations: vec![],
            snapshot_support: true,
            host: Some(PoolRef::new("b1", pool)),
            share_network_id: None,
            share_server_id: None,
            consistency_group_id: None,
            snapshot_id: None,
            replication_type: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
