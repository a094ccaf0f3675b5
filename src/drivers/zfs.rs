//! ZFS on Linux Driver
//!
//! Shares are ZFS datasets exported over NFS from a single address.
//! Backends in the same `replication_domain` replicate datasets to each
//! other (readable replication): a new replica starts out of sync and is
//! reported in sync by the next state poll once the initial send finishes.

use crate::config::BackendConfig;
use crate::domain::model::{
    AccessRule, AccessType, ExportLocation, Replica, ReplicaState, ReplicationType, Share,
    ShareProtocol, ShareServer, Snapshot,
};
use crate::domain::ports::{
    pool_of, BackendStats, DriverCapabilities, ManagedShare, ReplicaStateUpdate, ReplicaUpdate,
    ReplicationContext, ShareDriver,
};
use crate::drivers::inventory::Inventory;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Driver for ZFS datasets
pub struct ZfsDriver {
    name: String,
    zone: String,
    config: BackendConfig,
    export_ip: String,
    inventory: Inventory,
    /// Replicas whose initial send has not been confirmed yet
    pending_sync: Mutex<HashSet<String>>,
}

impl ZfsDriver {
    /// Create a new ZFS driver
    pub fn new(name: &str, config: &BackendConfig, zone: &str) -> Result<Self> {
        if config.driver_handles_share_servers {
            return Err(Error::Configuration(format!(
                "backend {}: zfs requires driver_handles_share_servers = False",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            zone: zone.to_string(),
            config: config.clone(),
            export_ip: config.option_or("share_export_ip", "10.0.0.5"),
            inventory: Inventory::new(name, config),
            pending_sync: Mutex::new(HashSet::new()),
        })
    }

    fn dataset(pool: &str, id: &str) -> String {
        format!("{}/share_{}", pool, id.replace('-', "_"))
    }

    fn export_location(&self, dataset: &str) -> ExportLocation {
        ExportLocation::new(format!("{}:/{}", self.export_ip, dataset))
    }

    fn replicates(&self) -> bool {
        self.config.replication_domain.is_some()
    }

    fn provision(&self, owner: &str, pool: &str, size_gb: u64) -> Result<ExportLocation> {
        let dataset = Self::dataset(pool, owner);
        debug!("zfs create -o quota={}G {}", size_gb, dataset);
        self.inventory.add_share(owner, pool, &dataset, size_gb)?;
        Ok(self.export_location(&dataset))
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }
}

#[async_trait]
impl ShareDriver for ZfsDriver {
    fn backend_name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            handles_share_servers: false,
            supports_snapshots: true,
            supports_create_from_snapshot: true,
            supports_cg: false,
            supports_replication: self.replicates(),
            supports_manage: true,
        }
    }

    async fn get_share_stats(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            backend_name: self.name.clone(),
            share_backend_name: self
                .config
                .share_backend_name
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            driver_name: "ZFSonLinuxShareDriver".into(),
            vendor_name: "Open Source".into(),
            driver_version: "1.0".into(),
            storage_protocols: vec![ShareProtocol::Nfs],
            driver_handles_share_servers: false,
            snapshot_support: true,
            consistency_group_support: false,
            replication_type: self.replicates().then_some(ReplicationType::Readable),
            replication_domain: self.config.replication_domain.clone(),
            availability_zone: self.zone.clone(),
            pools: self.inventory.pool_stats(),
        })
    }

    async fn create_share(
        &self,
        share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        if share.protocol != ShareProtocol::Nfs {
            return Err(Error::DriverOperationFatal {
                backend: self.name.clone(),
                operation: "create_share".into(),
                reason: format!("protocol {} is not supported", share.protocol),
            });
        }
        let pool = pool_of(&self.name, share.host.as_ref())?;
        Ok(vec![self.provision(&share.id, pool, share.size_gb)?])
    }

    async fn create_share_from_snapshot(
        &self,
        share: &Share,
        snapshot: &Snapshot,
        _server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        let source = self.inventory.snapshot(&snapshot.id).ok_or_else(|| {
            Error::DriverOperationFatal {
                backend: self.name.clone(),
                operation: "create_share_from_snapshot".into(),
                reason: format!("snapshot {} not found", snapshot.id),
            }
        })?;
        let pool = pool_of(&self.name, share.host.as_ref())?;
        let dataset = Self::dataset(pool, &share.id);
        debug!("zfs clone {} {}", source.location, dataset);
        self.inventory
            .add_share_with_data(&share.id, pool, &dataset, share.size_gb, source.fingerprint)?;
        Ok(vec![self.export_location(&dataset)])
    }

    async fn delete_share(&self, share: &Share, _server: Option<&ShareServer>) -> Result<()> {
        match self.inventory.remove_share(&share.id) {
            Some(removed) => debug!("zfs destroy -r {}", removed.path),
            None => debug!("dataset for share {} already gone", share.id),
        }
        Ok(())
    }

    async fn extend_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        self.inventory.extend(&share.id, new_size_gb)
    }

    async fn shrink_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        self.inventory.shrink(&share.id, new_size_gb)
    }

    async fn allow_access(
        &self,
        share: &Share,
        rule: &AccessRule,
        _server: Option<&ShareServer>,
    ) -> Result<Option<String>> {
        if rule.access_type != AccessType::Ip {
            return Err(Error::InvalidShareAccess(format!(
                "only ip access is supported, got {}",
                rule.access_type
            )));
        }
        self.inventory.grant(
            &share.id,
            &rule.id,
            format!("{}({})", rule.access_to, rule.access_level),
        )?;
        Ok(None)
    }

    async fn deny_access(
        &self,
        share: &Share,
        rule: &AccessRule,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        self.inventory.revoke(&share.id, &rule.id)
    }

    async fn create_snapshot(
        &self,
        snapshot: &Snapshot,
        share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<Option<String>> {
        let source = self.inventory.share(&share.id).ok_or_else(|| {
            Error::DriverOperationFatal {
                backend: self.name.clone(),
                operation: "create_snapshot".into(),
                reason: format!("share {} not found", share.id),
            }
        })?;
        let location = format!("{}@snapshot_{}", source.path, snapshot.id.replace('-', "_"));
        self.inventory
            .add_snapshot(&snapshot.id, &share.id, location.clone())?;
        Ok(Some(location))
    }

    async fn delete_snapshot(
        &self,
        snapshot: &Snapshot,
        _share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        self.inventory.remove_snapshot(&snapshot.id);
        Ok(())
    }

    async fn manage_existing(
        &self,
        share: &Share,
        export_path: &str,
        _driver_options: &BTreeMap<String, String>,
    ) -> Result<ManagedShare> {
        let dataset = export_path
            .split_once(":/")
            .map(|(_, d)| d.to_string())
            .ok_or_else(|| {
                Error::InvalidRequest(format!("unrecognized export location {}", export_path))
            })?;
        let adopted = self.inventory.adopt(&dataset, &share.id)?;
        info!("Managing dataset {} as share {}", dataset, share.id);
        Ok(ManagedShare {
            size_gb: adopted.size_gb,
            export_locations: vec![self.export_location(&adopted.path)],
        })
    }

    async fn unmanage(&self, share: &Share) -> Result<()> {
        self.inventory.release(&share.id)
    }

    async fn create_replica(
        &self,
        ctx: ReplicationContext<'_>,
        new_replica: &Replica,
    ) -> Result<ReplicaUpdate> {
        let pool = pool_of(&self.name, Some(&new_replica.host))?;
        let export = self.provision(&new_replica.id, pool, ctx.share.size_gb)?;
        if let Some(active) = ctx.active() {
            debug!("zfs send {} -> {}", active.host, new_replica.host);
        }
        self.pending_sync.lock().insert(new_replica.id.clone());

        Ok(ReplicaUpdate {
            export_locations: vec![export],
            replica_state: ReplicaState::OutOfSync,
        })
    }

    async fn delete_replica(&self, _ctx: ReplicationContext<'_>, replica: &Replica) -> Result<()> {
        self.pending_sync.lock().remove(&replica.id);
        self.inventory.remove_share(&replica.id);
        Ok(())
    }

    async fn promote_replica(
        &self,
        ctx: ReplicationContext<'_>,
        replica: &Replica,
    ) -> Result<Vec<ReplicaStateUpdate>> {
        self.pending_sync.lock().remove(&replica.id);
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
        _ctx: ReplicationContext<'_>,
        replica: &Replica,
    ) -> Result<ReplicaState> {
        if self.inventory.share(&replica.id).is_none() {
            return Ok(ReplicaState::Error);
        }
        self.pending_sync.lock().remove(&replica.id);
        Ok(ReplicaState::InSync)
    }
}
