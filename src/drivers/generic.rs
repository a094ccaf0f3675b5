//! Generic NFS/CIFS Driver
//!
//! Serves NFS and CIFS shares from a service endpoint. With
//! `driver_handles_share_servers` on, every share network gets its own
//! service instance (share server) with its own address; with it off, all
//! shares are exported from the configured `service_ip`.

use crate::config::BackendConfig;
use crate::domain::model::{
    AccessRule, AccessType, ExportLocation, Share, ShareNetwork, ShareProtocol, ShareServer,
    Snapshot,
};
use crate::domain::ports::{pool_of, BackendStats, DriverCapabilities, ManagedShare, ShareDriver};
use crate::drivers::inventory::Inventory;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

// =============================================================================
// Generic Driver
// =============================================================================

/// Driver exporting NFS/CIFS shares from service instances
pub struct GenericDriver {
    name: String,
    zone: String,
    config: BackendConfig,
    /// Export address when share servers are not handled
    service_ip: String,
    /// Prefix for addresses handed to new share servers
    service_ip_prefix: String,
    inventory: Inventory,
    servers: RwLock<BTreeMap<String, String>>,
    next_host: AtomicU32,
}

impl GenericDriver {
    /// Create a new generic driver
    pub fn new(name: &str, config: &BackendConfig, zone: &str) -> Self {
        Self {
            name: name.to_string(),
            zone: zone.to_string(),
            config: config.clone(),
            service_ip: config.option_or("service_ip", "10.254.0.2"),
            service_ip_prefix: config.option_or("service_ip_prefix", "10.254.1."),
            inventory: Inventory::new(name, config),
            servers: RwLock::new(BTreeMap::new()),
            next_host: AtomicU32::new(10),
        }
    }

    fn dhss(&self) -> bool {
        self.config.driver_handles_share_servers
    }

    fn fatal(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::DriverOperationFatal {
            backend: self.name.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Address the share is exported from
    fn endpoint(&self, server: Option<&ShareServer>, operation: &str) -> Result<String> {
        if !self.dhss() {
            return Ok(self.service_ip.clone());
        }
        server
            .and_then(|s| s.backend_details.get("service_ip").cloned())
            .ok_or_else(|| self.fatal(operation, "share server with service_ip required"))
    }

    fn backend_path(id: &str) -> String {
        format!("/shares/share-{}", id)
    }

    fn export_location(ip: &str, protocol: ShareProtocol, path: &str) -> ExportLocation {
        match protocol {
            ShareProtocol::Cifs => {
                let name = path.rsplit('/').next().unwrap_or(path);
                ExportLocation::new(format!("\\\\{}\\{}", ip, name))
            }
            _ => ExportLocation::new(format!("{}:{}", ip, path)),
        }
    }

    /// Backend path named by an NFS or CIFS export location
    fn path_from_export(export_path: &str) -> Option<String> {
        if let Some(rest) = export_path.strip_prefix("\\\\") {
            let (_, name) = rest.split_once('\\')?;
            return Some(format!("/shares/{}", name));
        }
        export_path.split_once(':').map(|(_, p)| p.to_string())
    }

    fn check_protocol(&self, share: &Share, operation: &str) -> Result<()> {
        match share.protocol {
            ShareProtocol::Nfs | ShareProtocol::Cifs => Ok(()),
            other => Err(self.fatal(operation, format!("protocol {} is not supported", other))),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }
}

#[async_trait]
impl ShareDriver for GenericDriver {
    fn backend_name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            handles_share_servers: self.dhss(),
            supports_snapshots: true,
            supports_create_from_snapshot: true,
            supports_cg: false,
            supports_replication: false,
            supports_manage: !self.dhss(),
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
            driver_name: "GenericShareDriver".into(),
            vendor_name: "Open Source".into(),
            driver_version: "1.0".into(),
            storage_protocols: vec![ShareProtocol::Nfs, ShareProtocol::Cifs],
            driver_handles_share_servers: self.dhss(),
            snapshot_support: true,
            consistency_group_support: false,
            replication_type: None,
            replication_domain: None,
            availability_zone: self.zone.clone(),
            pools: self.inventory.pool_stats(),
        })
    }

    async fn create_share(
        &self,
        share: &Share,
        server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        self.check_protocol(share, "create_share")?;
        let ip = self.endpoint(server, "create_share")?;
        let pool = pool_of(&self.name, share.host.as_ref())?;
        let path = Self::backend_path(&share.id);

        info!("Creating {} share {} on {}", share.protocol, share.id, ip);
        self.inventory.add_share(&share.id, pool, &path, share.size_gb)?;
        Ok(vec![Self::export_location(&ip, share.protocol, &path)])
    }

    async fn create_share_from_snapshot(
        &self,
        share: &Share,
        snapshot: &Snapshot,
        server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        self.check_protocol(share, "create_share_from_snapshot")?;
        let ip = self.endpoint(server, "create_share_from_snapshot")?;
        let source = self.inventory.snapshot(&snapshot.id).ok_or_else(|| {
            self.fatal(
                "create_share_from_snapshot",
                format!("snapshot {} not found", snapshot.id),
            )
        })?;
        let pool = pool_of(&self.name, share.host.as_ref())?;
        let path = Self::backend_path(&share.id);

        self.inventory
            .add_share_with_data(&share.id, pool, &path, share.size_gb, source.fingerprint)?;
        Ok(vec![Self::export_location(&ip, share.protocol, &path)])
    }

    async fn delete_share(&self, share: &Share, _server: Option<&ShareServer>) -> Result<()> {
        if self.inventory.remove_share(&share.id).is_none() {
            debug!("Generic share {} already gone", share.id);
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
        let allowed = match share.protocol {
            ShareProtocol::Nfs => rule.access_type == AccessType::Ip,
            ShareProtocol::Cifs => {
                matches!(rule.access_type, AccessType::Ip | AccessType::User)
            }
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidShareAccess(format!(
                "{} access is not supported for {} shares",
                rule.access_type, share.protocol
            )));
        }

        self.inventory.grant(
            &share.id,
            &rule.id,
            format!("{}:{}", rule.access_to, rule.access_level),
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
        let location = format!("snapshot-{}", snapshot.id);
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
        if self.dhss() {
            return Err(Error::DriverCapability {
                backend: self.name.clone(),
                capability: "manage with share servers".into(),
            });
        }
        self.check_protocol(share, "manage_existing")?;
        let path = Self::path_from_export(export_path).ok_or_else(|| {
            Error::InvalidRequest(format!("unrecognized export location {}", export_path))
        })?;

        let adopted = self.inventory.adopt(&path, &share.id)?;
        Ok(ManagedShare {
            size_gb: adopted.size_gb,
            export_locations: vec![Self::export_location(
                &self.service_ip,
                share.protocol,
                &adopted.path,
            )],
        })
    }

    async fn unmanage(&self, share: &Share) -> Result<()> {
        self.inventory.release(&share.id)
    }

    async fn setup_server(
        &self,
        network: &ShareNetwork,
        server_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed);
        let ip = format!("{}{}", self.service_ip_prefix, host);
        info!(
            "Starting service instance for server {} on network {} at {}",
            server_id, network.name, ip
        );
        self.servers.write().insert(server_id.to_string(), ip.clone());

        let mut details = BTreeMap::new();
        details.insert("service_ip".to_string(), ip);
        details.insert("instance_id".to_string(), format!("instance-{}", server_id));
        Ok(details)
    }

    async fn teardown_server(&self, server: &ShareServer) -> Result<()> {
        info!("Stopping service instance for server {}", server.id);
        self.servers.write().remove(&server.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::domain::model::{
        new_id, AccessLevel, AccessState, PoolRef, ShareServerStatus, ShareStatus,
    };
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn config(dhss: bool) -> BackendConfig {
        BackendConfig {
            driver: crate::config::DriverKind::Generic,
            driver_handles_share_servers: dhss,
            pools: vec![PoolConfig {
                name: "lvm".into(),
                total_capacity_gb: 50,
            }],
            ..Default::default()
        }
    }

    fn share(protocol: ShareProtocol) -> Share {
        Share {
            id: new_id(),
            name: "s".into(),
            size_gb: 2,
            protocol,
            share_type: "default".into(),
            extra_specs: BTreeMap::new(),
            availability_zone: None,
            status: ShareStatus::Creating,
            status_reason: None,
            export_locations: vec![],
            snapshot_support: true,
            host: Some(PoolRef::new("generic1", "lvm")),
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
    async fn test_dhss_requires_server() {
        let driver = GenericDriver::new("generic1", &config(true), "nova");
        let share = share(ShareProtocol::Nfs);
        assert!(driver.create_share(&share, None).await.is_err());

        let network = ShareNetwork {
            id: new_id(),
            name: "tenant-net".into(),
            cidr: None,
            created_at: Utc::now(),
        };
        let details = driver.setup_server(&network, "srv-1").await.unwrap();
        let server = ShareServer {
            id: "srv-1".into(),
            share_network_id: network.id.clone(),
            backend: "generic1".into(),
            status: ShareServerStatus::Active,
            backend_details: details.clone(),
            references: BTreeSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let exports = driver.create_share(&share, Some(&server)).await.unwrap();
        assert!(exports[0].path.starts_with(&details["service_ip"]));
    }

    #[tokio::test]
    async fn test_cifs_export_and_user_access() {
        let driver = GenericDriver::new("generic1", &config(false), "nova");
        let share = share(ShareProtocol::Cifs);
        let exports = driver.create_share(&share, None).await.unwrap();
        assert_eq!(exports[0].path, format!("\\\\10.254.0.2\\share-{}", share.id));

        let rule = AccessRule {
            id: new_id(),
            share_id: share.id.clone(),
            access_type: AccessType::User,
            access_to: "bob".into(),
            access_level: AccessLevel::Ro,
            state: AccessState::New,
            access_key: None,
            created_at: Utc::now(),
        };
        driver.allow_access(&share, &rule, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_nfs_rejects_user_access() {
        let driver = GenericDriver::new("generic1", &config(false), "nova");
        let share = share(ShareProtocol::Nfs);
        driver.create_share(&share, None).await.unwrap();

        let rule = AccessRule {
            id: new_id(),
            share_id: share.id.clone(),
            access_type: AccessType::User,
            access_to: "bob".into(),
            access_level: AccessLevel::Rw,
            state: AccessState::New,
            access_key: None,
            created_at: Utc::now(),
        };
        assert_matches!(
            driver.allow_access(&share, &rule, None).await,
            Err(Error::InvalidShareAccess(_))
        );
    }

    #[test]
    fn test_path_from_export() {
        assert_eq!(
            GenericDriver::path_from_export("10.0.0.1:/shares/share-x").as_deref(),
            Some("/shares/share-x")
        );
        assert_eq!(
            GenericDriver::path_from_export("\\\\10.0.0.1\\share-x").as_deref(),
            Some("/shares/share-x")
        );
    }
}
