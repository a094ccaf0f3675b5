//! Share Server Manager
//!
//! Share servers are created on demand for backends that handle share
//! servers, one per (share network, backend), and reference counted by the
//! shares and consistency groups placed on them. Creation and teardown are
//! serialized per share network.

use super::locks::KeyedLocks;
use super::retry::{failure_reason, DriverRetry};
use crate::config::ManagerConfig;
use crate::domain::model::{new_id, ShareServer, ShareServerStatus};
use crate::drivers::DriverRegistry;
use crate::error::{Error, Result};
use crate::events::{EventBus, ShareEvent};
use crate::store::StateStore;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct ShareServerManager {
    store: Arc<StateStore>,
    drivers: Arc<DriverRegistry>,
    network_locks: KeyedLocks,
    retry: DriverRetry,
    events: EventBus,
    config: ManagerConfig,
}

impl ShareServerManager {
    pub fn new(
        store: Arc<StateStore>,
        drivers: Arc<DriverRegistry>,
        retry: DriverRetry,
        events: EventBus,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            drivers,
            network_locks: KeyedLocks::new(),
            retry,
            events,
            config,
        }
    }

    /// Server for `consumer` on `backend` in a share network, created if needed
    pub async fn ensure_server(
        &self,
        network_id: &str,
        backend: &str,
        consumer: &str,
    ) -> Result<ShareServer> {
        let network = self.store.share_networks.require(network_id)?;
        let _guard = self.network_locks.lock(network_id).await;

        let existing = self.store.share_servers.find(|s| {
            s.share_network_id == network_id
                && s.backend == backend
                && s.status == ShareServerStatus::Active
        });
        if let Some(server) = existing {
            let consumer = consumer.to_string();
            return self.store.share_servers.modify(&server.id, |s| {
                s.references.insert(consumer);
                s.updated_at = Utc::now();
            });
        }

        let driver = self.drivers.get(backend)?;
        let now = Utc::now();
        let server = ShareServer {
            id: new_id(),
            share_network_id: network_id.to_string(),
            backend: backend.to_string(),
            status: ShareServerStatus::Creating,
            backend_details: BTreeMap::new(),
            references: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.share_servers.insert(server.clone())?;
        info!("Creating share server {} on {} for network {}", server.id, backend, network_id);

        let result = self
            .retry
            .call(backend, "setup_server", || driver.setup_server(&network, &server.id))
            .await;

        match result {
            Ok(details) => {
                let consumer = consumer.to_string();
                let server = self.store.share_servers.modify(&server.id, |s| {
                    s.backend_details = details;
                    s.references.insert(consumer);
                    s.status = ShareServerStatus::Active;
                    s.updated_at = Utc::now();
                })?;
                self.events.publish(ShareEvent::ShareServerChanged {
                    server_id: server.id.clone(),
                    active: true,
                });
                Ok(server)
            }
            Err(e) => {
                error!("Share server {} setup failed: {}", server.id, e);
                // Setup may have left partial resources behind on the backend
                if let Err(cleanup) = driver.teardown_server(&server).await {
                    warn!("Cleanup of failed share server {} failed: {}", server.id, cleanup);
                }
                self.store.share_servers.remove(&server.id);
                Err(e)
            }
        }
    }

    /// Drop a consumer's reference; tears the server down after the last one
    pub async fn release(&self, server_id: &str, consumer: &str) -> Result<()> {
        let Some(server) = self.store.share_servers.get(server_id) else {
            return Ok(());
        };
        let _guard = self.network_locks.lock(&server.share_network_id).await;

        let server = self.store.share_servers.modify(server_id, |s| {
            s.references.remove(consumer);
            s.updated_at = Utc::now();
        })?;
        if server.references.is_empty() && self.config.delete_share_server_with_last_share {
            self.teardown_locked(&server).await?;
        }
        Ok(())
    }

    /// Tear down an unused server
    pub async fn teardown(&self, server_id: &str) -> Result<()> {
        let server = self.store.share_servers.require(server_id)?;
        let _guard = self.network_locks.lock(&server.share_network_id).await;

        let server = self.store.share_servers.require(server_id)?;
        if !server.references.is_empty() {
            return Err(Error::ShareServerInUse {
                server_id: server.id.clone(),
                share_count: server.references.len(),
            });
        }
        self.teardown_locked(&server).await
    }

    async fn teardown_locked(&self, server: &ShareServer) -> Result<()> {
        let driver = self.drivers.get(&server.backend)?;
        self.store.share_servers.modify(&server.id, |s| {
            s.status = ShareServerStatus::Deleting;
            s.updated_at = Utc::now();
        })?;

        let result = self
            .retry
            .call(&server.backend, "teardown_server", || driver.teardown_server(server))
            .await;
        match result {
            Ok(()) => {
                self.store.share_servers.remove(&server.id);
                info!("Share server {} deleted", server.id);
                self.events.publish(ShareEvent::ShareServerChanged {
                    server_id: server.id.clone(),
                    active: false,
                });
                Ok(())
            }
            Err(e) => {
                warn!("{}", failure_reason("teardown_server", &e));
                self.store.share_servers.modify(&server.id, |s| {
                    s.status = ShareServerStatus::Error;
                    s.updated_at = Utc::now();
                })?;
                Err(e)
            }
        }
    }

    /// Tear down servers that have had no consumers for `min_age`
    ///
    /// Unreferenced servers left in `error` by a failed teardown are
    /// retried here as well.
    pub async fn cleanup_unused(&self, min_age: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(min_age) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };
        let idle = self.store.share_servers.filter(|s| {
            matches!(s.status, ShareServerStatus::Active | ShareServerStatus::Error)
                && s.references.is_empty()
                && s.updated_at <= cutoff
        });

        let mut removed = 0;
        for server in idle {
            match self.teardown(&server.id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Cleanup of share server {} failed: {}", server.id, e),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, PoolConfig};
    use crate::domain::model::ShareNetwork;
    use crate::drivers::{FakeDriver, Fault};
    use crate::metrics::ControlPlaneMetrics;
    use assert_matches::assert_matches;

    fn setup(config: ManagerConfig) -> (ShareServerManager, Arc<FakeDriver>, Arc<StateStore>) {
        let backend = BackendConfig {
            driver_handles_share_servers: true,
            pools: vec![PoolConfig {
                name: "p".into(),
                total_capacity_gb: 10,
            }],
            ..Default::default()
        };
        let driver = Arc::new(FakeDriver::new("b1", &backend, "nova"));
        let drivers = DriverRegistry::new();
        drivers.register(driver.clone()).unwrap();

        let store = StateStore::new();
        store
            .share_networks
            .insert(ShareNetwork {
                id: "net1".into(),
                name: "tenant".into(),
                cidr: Some("10.10.0.0/24".into()),
                created_at: Utc::now(),
            })
            .unwrap();

        let retry_config = ManagerConfig {
            driver_retry_initial_interval_ms: 1,
            driver_retry_max_interval_ms: 1,
            ..config.clone()
        };
        let retry = DriverRetry::new(&retry_config, ControlPlaneMetrics::new().unwrap());
        let manager =
            ShareServerManager::new(store.clone(), drivers, retry, EventBus::default(), config);
        (manager, driver, store)
    }

    #[tokio::test]
    async fn test_servers_are_shared_and_refcounted() {
        let (manager, driver, store) = setup(ManagerConfig::default());
        let a = manager.ensure_server("net1", "b1", "share-a").await.unwrap();
        let b = manager.ensure_server("net1", "b1", "share-b").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(driver.call_count("setup_server"), 1);
        assert_eq!(b.references.len(), 2);

        manager.release(&a.id, "share-a").await.unwrap();
        assert!(store.share_servers.contains(&a.id));
        manager.release(&a.id, "share-b").await.unwrap();
        assert!(!store.share_servers.contains(&a.id));
    }

    #[tokio::test]
    async fn test_teardown_refused_while_in_use() {
        let (manager, _, _) = setup(ManagerConfig::default());
        let server = manager.ensure_server("net1", "b1", "share-a").await.unwrap();
        assert_matches!(
            manager.teardown(&server.id).await,
            Err(Error::ShareServerInUse { share_count: 1, .. })
        );
    }

    #[tokio::test]
    async fn test_failed_setup_leaves_no_server() {
        let (manager, driver, store) = setup(ManagerConfig::default());
        driver.inject_fault("setup_server", Fault::Fatal, 1);
        assert!(manager.ensure_server("net1", "b1", "share-a").await.is_err());

        assert!(store.share_servers.is_empty());
        assert_eq!(driver.call_count("teardown_server"), 1);

        // The next consumer gets a fresh server
        let server = manager.ensure_server("net1", "b1", "share-b").await.unwrap();
        assert_eq!(server.status, ShareServerStatus::Active);
        assert_eq!(store.share_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_failed_teardown() {
        let config = ManagerConfig {
            delete_share_server_with_last_share: false,
            ..Default::default()
        };
        let (manager, driver, store) = setup(config);
        let server = manager.ensure_server("net1", "b1", "share-a").await.unwrap();
        manager.release(&server.id, "share-a").await.unwrap();

        driver.inject_fault("teardown_server", Fault::Fatal, 1);
        assert!(manager.teardown(&server.id).await.is_err());
        assert_eq!(
            store.share_servers.require(&server.id).unwrap().status,
            ShareServerStatus::Error
        );

        assert_eq!(manager.cleanup_unused(Duration::ZERO).await, 1);
        assert!(store.share_servers.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_unused() {
        let config = ManagerConfig {
            delete_share_server_with_last_share: false,
            ..Default::default()
        };
        let (manager, _, store) = setup(config);
        let server = manager.ensure_server("net1", "b1", "share-a").await.unwrap();
        manager.release(&server.id, "share-a").await.unwrap();
        assert!(store.share_servers.contains(&server.id));

        assert_eq!(manager.cleanup_unused(Duration::from_secs(600)).await, 0);
        assert_eq!(manager.cleanup_unused(Duration::ZERO).await, 1);
        assert!(store.share_servers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_network() {
        let (manager, _, _) = setup(ManagerConfig::default());
        assert_matches!(
            manager.ensure_server("missing", "b1", "share-a").await,
            Err(Error::ResourceNotFound { .. })
        );
    }
}
