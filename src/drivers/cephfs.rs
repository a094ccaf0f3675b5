//! CephFS Native Driver
//!
//! Provisions shares as CephFS volumes under `/volumes/<group>/<share>`.
//! Clients mount with the native protocol and authenticate with cephx
//! identities, so the export location is the monitor list joined with the
//! volume path. Consistency groups map to volume groups and group
//! snapshots are taken in one step.

use crate::config::BackendConfig;
use crate::domain::model::{
    AccessLevel, AccessRule, AccessType, CgSnapshot, ConsistencyGroup, ExportLocation, Share,
    ShareProtocol, ShareServer, Snapshot,
};
use crate::domain::ports::{
    pool_of, BackendStats, CgSnapshotMemberUpdate, DriverCapabilities, ShareDriver,
};
use crate::domain::share_type::parse_bool_spec;
use crate::drivers::inventory::Inventory;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Volume group for shares outside any consistency group
const NO_GROUP: &str = "_nogroup";

/// Spec asking for a dedicated RADOS pool
const DATA_ISOLATED_SPEC: &str = "cephfs:data_isolated";

// =============================================================================
// Configuration
// =============================================================================

/// Settings read from the backend's `options`
#[derive(Debug, Clone)]
pub struct CephFsConfig {
    /// Monitor addresses, `host:port`
    pub mon_addrs: Vec<String>,
    /// cephx identity the driver itself uses
    pub auth_id: String,
    pub volume_prefix: String,
}

impl CephFsConfig {
    pub fn from_backend(config: &BackendConfig) -> Result<Self> {
        let mon_addrs: Vec<String> = config
            .option_or("mon_addrs", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if mon_addrs.is_empty() {
            return Err(Error::Configuration(
                "cephfs backend requires options.mon_addrs".into(),
            ));
        }

        Ok(Self {
            mon_addrs,
            auth_id: config.option_or("auth_id", "shareplane"),
            volume_prefix: config.option_or("volume_prefix", "/volumes"),
        })
    }
}

// =============================================================================
// CephFS Driver
// =============================================================================

/// Driver for CephFS volumes
pub struct CephFsDriver {
    name: String,
    zone: String,
    config: BackendConfig,
    ceph: CephFsConfig,
    inventory: Inventory,
    groups: RwLock<BTreeSet<String>>,
}

impl CephFsDriver {
    /// Create a new CephFS driver
    pub fn new(name: &str, config: &BackendConfig, zone: &str) -> Result<Self> {
        if config.driver_handles_share_servers {
            return Err(Error::Configuration(format!(
                "backend {}: cephfs requires driver_handles_share_servers = False",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            zone: zone.to_string(),
            config: config.clone(),
            ceph: CephFsConfig::from_backend(config)?,
            inventory: Inventory::new(name, config),
            groups: RwLock::new(BTreeSet::new()),
        })
    }

    fn volume_path(&self, share: &Share) -> String {
        let group = share.consistency_group_id.as_deref().unwrap_or(NO_GROUP);
        format!("{}/{}/{}", self.ceph.volume_prefix, group, share.id)
    }

    fn export_location(&self, path: &str) -> ExportLocation {
        ExportLocation::new(format!("{}:{}", self.ceph.mon_addrs.join(","), path))
    }

    fn fatal(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::DriverOperationFatal {
            backend: self.name.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }
}

#[async_trait]
impl ShareDriver for CephFsDriver {
    fn backend_name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            handles_share_servers: false,
            supports_snapshots: true,
            supports_create_from_snapshot: false,
            supports_cg: true,
            supports_replication: false,
            supports_manage: false,
        }
    }

    async fn do_setup(&self) -> Result<()> {
        info!(
            "CephFS backend {} using monitors {}",
            self.name,
            self.ceph.mon_addrs.join(",")
        );
        Ok(())
    }

    async fn get_share_stats(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            backend_name: self.name.clone(),
            share_backend_name: self
                .config
                .share_backend_name
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            driver_name: "CephFSNativeDriver".into(),
            vendor_name: "Ceph".into(),
            driver_version: "1.0".into(),
            storage_protocols: vec![ShareProtocol::Cephfs],
            driver_handles_share_servers: false,
            snapshot_support: true,
            consistency_group_support: true,
            replication_type: None,
            replication_domain: None,
            availability_zone: self.zone.clone(),
            pools: self.inventory.pool_stats(),
        })
    }

    async fn create_share(
        &self,
        share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        if share.protocol != ShareProtocol::Cephfs {
            return Err(self.fatal(
                "create_share",
                format!("protocol {} is not supported", share.protocol),
            ));
        }

        let pool = pool_of(&self.name, share.host.as_ref())?;
        let path = self.volume_path(share);
        let data_isolated = share
            .extra_specs
            .get(DATA_ISOLATED_SPEC)
            .and_then(|v| parse_bool_spec(v))
            .unwrap_or(false);

        info!(
            "Creating CephFS volume {} ({} GiB, data_isolated={})",
            path, share.size_gb, data_isolated
        );
        self.inventory.add_share(&share.id, pool, &path, share.size_gb)?;

        Ok(vec![self.export_location(&path)])
    }

    async fn delete_share(&self, share: &Share, _server: Option<&ShareServer>) -> Result<()> {
        info!("Deleting CephFS volume for share {}", share.id);
        if self.inventory.remove_share(&share.id).is_none() {
            debug!("CephFS volume for share {} already gone", share.id);
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
        if rule.access_type != AccessType::Cephx {
            return Err(Error::InvalidShareAccess(format!(
                "only cephx access is supported, got {}",
                rule.access_type
            )));
        }
        if rule.access_level != AccessLevel::Rw {
            return Err(Error::InvalidShareAccess(
                "only rw access level is supported".into(),
            ));
        }
        if rule.access_to == self.ceph.auth_id {
            return Err(Error::InvalidShareAccess(format!(
                "cephx identity {} is reserved",
                rule.access_to
            )));
        }

        self.inventory.grant(
            &share.id,
            &rule.id,
            format!("client.{}:rw", rule.access_to),
        )?;
        Ok(Some(format!("AQ{}==", uuid::Uuid::new_v4().simple())))
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
        let location = format!("{}/.snap/{}", self.volume_path(share), snapshot.id);
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

    async fn create_consistency_group(
        &self,
        cg: &ConsistencyGroup,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        info!("Creating CephFS volume group {}", cg.id);
        self.groups.write().insert(cg.id.clone());
        Ok(())
    }

    async fn delete_consistency_group(
        &self,
        cg: &ConsistencyGroup,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        self.groups.write().remove(&cg.id);
        Ok(())
    }

    async fn create_cgsnapshot(
        &self,
        cgsnapshot: &CgSnapshot,
        members: &[Share],
        _server: Option<&ShareServer>,
    ) -> Result<Vec<CgSnapshotMemberUpdate>> {
        if !self.groups.read().contains(&cgsnapshot.consistency_group_id) {
            return Err(self.fatal(
                "create_cgsnapshot",
                format!("volume group {} not found", cgsnapshot.consistency_group_id),
            ));
        }

        let group_snap = format!(
            "{}/{}/.snap/{}",
            self.ceph.volume_prefix, cgsnapshot.consistency_group_id, cgsnapshot.id
        );
        let mut updates = Vec::with_capacity(cgsnapshot.members.len());
        for member in &cgsnapshot.members {
            let share = members
                .iter()
                .find(|s| s.id == member.share_id)
                .ok_or_else(|| self.fatal("create_cgsnapshot", "member share missing"))?;
            let location = format!("{}/{}", group_snap, share.id);
            self.inventory
                .add_snapshot(&member.id, &share.id, location.clone())?;
            updates.push(CgSnapshotMemberUpdate {
                member_id: member.id.clone(),
                provider_location: Some(location),
            });
        }
        Ok(updates)
    }

    async fn delete_cgsnapshot(
        &self,
        cgsnapshot: &CgSnapshot,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        for member in &cgsnapshot.members {
            self.inventory.remove_snapshot(&member.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::domain::model::{new_id, AccessState, PoolRef, ShareStatus};
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn backend_config() -> BackendConfig {
        let mut options = BTreeMap::new();
        options.insert("mon_addrs".to_string(), "10.0.0.1:6789,10.0.0.2:6789".to_string());
        BackendConfig {
            driver: crate::config::DriverKind::Cephfs,
            pools: vec![PoolConfig {
                name: "cephfs".into(),
                total_capacity_gb: 10,
            }],
            options,
            ..Default::default()
        }
    }

    fn share() -> Share {
        Share {
            id: new_id(),
            name: "s".into(),
            size_gb: 1,
            protocol: ShareProtocol::Cephfs,
            share_type: "cephfstype".into(),
            extra_specs: BTreeMap::new(),
            availability_zone: None,
            status: ShareStatus::Creating,
            status_reason: None,
            export_locations: vec![],
            snapshot_support: true,
            host: Some(PoolRef::new("cephfs1", "cephfs")),
            share_network_id: None,
            share_server_id: None,
            consistency_group_id: None,
            snapshot_id: None,
            replication_type: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule(share: &Share, access_type: AccessType, level: AccessLevel) -> AccessRule {
        AccessRule {
            id: new_id(),
            share_id: share.id.clone(),
            access_type,
            access_to: "alice".into(),
            access_level: level,
            state: AccessState::New,
            access_key: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_dhss_true_rejected() {
        let mut config = backend_config();
        config.driver_handles_share_servers = true;
        assert_matches!(
            CephFsDriver::new("cephfs1", &config, "nova").err(),
            Some(Error::Configuration(_))
        );
    }

    #[test]
    fn test_mon_addrs_required() {
        let mut config = backend_config();
        config.options.clear();
        assert!(CephFsDriver::new("cephfs1", &config, "nova").is_err());
    }

    #[tokio::test]
    async fn test_export_location_format() {
        let driver = CephFsDriver::new("cephfs1", &backend_config(), "nova").unwrap();
        let share = share();

        let exports = driver.create_share(&share, None).await.unwrap();
        assert_eq!(
            exports[0].path,
            format!("10.0.0.1:6789,10.0.0.2:6789:/volumes/_nogroup/{}", share.id)
        );
    }

    #[tokio::test]
    async fn test_only_cephx_rw_access() {
        let driver = CephFsDriver::new("cephfs1", &backend_config(), "nova").unwrap();
        let share = share();
        driver.create_share(&share, None).await.unwrap();

        let ip = rule(&share, AccessType::Ip, AccessLevel::Rw);
        assert_matches!(
            driver.allow_access(&share, &ip, None).await,
            Err(Error::InvalidShareAccess(_))
        );

        let ro = rule(&share, AccessType::Cephx, AccessLevel::Ro);
        assert!(driver.allow_access(&share, &ro, None).await.is_err());

        let ok = rule(&share, AccessType::Cephx, AccessLevel::Rw);
        let key = driver.allow_access(&share, &ok, None).await.unwrap();
        assert!(key.unwrap().starts_with("AQ"));
    }

    #[tokio::test]
    async fn test_shrink_possible_data_loss() {
        let driver = CephFsDriver::new("cephfs1", &backend_config(), "nova").unwrap();
        let mut share = share();
        share.size_gb = 4;
        driver.create_share(&share, None).await.unwrap();
        driver.inventory().set_usage(&share.id, 3).unwrap();

        assert_matches!(
            driver.shrink_share(&share, 2, None).await,
            Err(Error::ShrinkPossibleDataLoss { .. })
        );
        driver.shrink_share(&share, 3, None).await.unwrap();
    }
}
