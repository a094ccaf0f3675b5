//! Domain Ports - Core trait definitions for share backends
//!
//! `ShareDriver` is the boundary between the control plane and a storage
//! backend. Every driver implements the common share operations; optional
//! extensions (snapshots, share servers, consistency groups, replication,
//! manage) have default bodies that refuse with `DriverCapability`, and the
//! driver advertises which of them it overrides through
//! [`DriverCapabilities`].

use crate::domain::model::{
    AccessRule, CgSnapshot, ConsistencyGroup, ExportLocation, PoolRef, Replica, ReplicaState,
    ReplicationType, Share, ShareNetwork, ShareProtocol, ShareServer, Snapshot,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Capabilities & Stats
// =============================================================================

/// Optional features a driver implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    pub handles_share_servers: bool,
    pub supports_snapshots: bool,
    pub supports_create_from_snapshot: bool,
    pub supports_cg: bool,
    pub supports_replication: bool,
    pub supports_manage: bool,
}

/// Capacity and capability record for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub total_capacity_gb: u64,
    pub free_capacity_gb: u64,
    pub allocated_capacity_gb: u64,
    pub provisioned_capacity_gb: u64,
    pub reserved_percentage: u8,
    pub thin_provisioning: bool,
    pub max_over_subscription_ratio: f64,
    /// Free-form capabilities matched by extra specs
    pub capabilities: BTreeMap<String, String>,
}

/// Periodic report from one driver instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend_name: String,
    pub share_backend_name: String,
    pub driver_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocols: Vec<ShareProtocol>,
    pub driver_handles_share_servers: bool,
    pub snapshot_support: bool,
    pub consistency_group_support: bool,
    pub replication_type: Option<ReplicationType>,
    pub replication_domain: Option<String>,
    pub availability_zone: String,
    pub pools: Vec<PoolStats>,
}

// =============================================================================
// Operation Results
// =============================================================================

/// What a driver learned about an existing share it took over
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedShare {
    pub size_gb: u64,
    pub export_locations: Vec<ExportLocation>,
}

/// Backend handle for one consistency group snapshot member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgSnapshotMemberUpdate {
    pub member_id: String,
    pub provider_location: Option<String>,
}

/// Result of creating a replica on a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaUpdate {
    pub export_locations: Vec<ExportLocation>,
    pub replica_state: ReplicaState,
}

/// Per-replica state reported after a promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStateUpdate {
    pub replica_id: String,
    pub replica_state: ReplicaState,
}

/// Context passed to replication operations
#[derive(Debug, Clone, Copy)]
pub struct ReplicationContext<'a> {
    pub share: &'a Share,
    pub replicas: &'a [Replica],
    pub access_rules: &'a [AccessRule],
}

impl ReplicationContext<'_> {
    /// The current active replica, if any
    pub fn active(&self) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.is_active())
    }
}

// =============================================================================
// Share Driver
// =============================================================================

fn unsupported<T>(backend: &str, capability: &str) -> Result<T> {
    Err(Error::DriverCapability {
        backend: backend.to_string(),
        capability: capability.to_string(),
    })
}

/// Trait implemented by every share backend
#[async_trait]
pub trait ShareDriver: Send + Sync {
    /// Configuration name of this backend instance
    fn backend_name(&self) -> &str;

    /// Optional features this driver implements
    fn capabilities(&self) -> DriverCapabilities;

    /// Validate configuration and connect to the backend
    async fn do_setup(&self) -> Result<()> {
        Ok(())
    }

    /// Check backend health
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Report capacity and capabilities for the scheduler
    async fn get_share_stats(&self) -> Result<BackendStats>;

    // -------------------------------------------------------------------------
    // Shares
    // -------------------------------------------------------------------------

    async fn create_share(
        &self,
        share: &Share,
        server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>>;

    async fn delete_share(&self, share: &Share, server: Option<&ShareServer>) -> Result<()>;

    async fn extend_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        server: Option<&ShareServer>,
    ) -> Result<()>;

    /// Must refuse with `ShrinkPossibleDataLoss` when data would not fit
    async fn shrink_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        server: Option<&ShareServer>,
    ) -> Result<()>;

    /// Apply a rule; returns an access key for backends that mint one
    async fn allow_access(
        &self,
        share: &Share,
        rule: &AccessRule,
        server: Option<&ShareServer>,
    ) -> Result<Option<String>>;

    async fn deny_access(
        &self,
        share: &Share,
        rule: &AccessRule,
        server: Option<&ShareServer>,
    ) -> Result<()>;

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Returns the backend location of the snapshot
    async fn create_snapshot(
        &self,
        _snapshot: &Snapshot,
        _share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<Option<String>> {
        unsupported(self.backend_name(), "snapshots")
    }

    async fn delete_snapshot(
        &self,
        _snapshot: &Snapshot,
        _share: &Share,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        unsupported(self.backend_name(), "snapshots")
    }

    async fn create_share_from_snapshot(
        &self,
        _share: &Share,
        _snapshot: &Snapshot,
        _server: Option<&ShareServer>,
    ) -> Result<Vec<ExportLocation>> {
        unsupported(self.backend_name(), "create_share_from_snapshot")
    }

    // -------------------------------------------------------------------------
    // Manage / Unmanage
    // -------------------------------------------------------------------------

    /// Take over an existing backend share at `export_path`
    async fn manage_existing(
        &self,
        _share: &Share,
        _export_path: &str,
        _driver_options: &BTreeMap<String, String>,
    ) -> Result<ManagedShare> {
        unsupported(self.backend_name(), "manage")
    }

    /// Stop managing a share, leaving its data in place
    async fn unmanage(&self, _share: &Share) -> Result<()> {
        unsupported(self.backend_name(), "unmanage")
    }

    // -------------------------------------------------------------------------
    // Share Servers
    // -------------------------------------------------------------------------

    /// Create a tenant endpoint; returns backend details
    async fn setup_server(
        &self,
        _network: &ShareNetwork,
        _server_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        unsupported(self.backend_name(), "share servers")
    }

    async fn teardown_server(&self, _server: &ShareServer) -> Result<()> {
        unsupported(self.backend_name(), "share servers")
    }

    // -------------------------------------------------------------------------
    // Consistency Groups
    // -------------------------------------------------------------------------

    async fn create_consistency_group(
        &self,
        _cg: &ConsistencyGroup,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        unsupported(self.backend_name(), "consistency groups")
    }

    async fn delete_consistency_group(
        &self,
        _cg: &ConsistencyGroup,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        unsupported(self.backend_name(), "consistency groups")
    }

    /// Snapshot every member at one consistency point
    async fn create_cgsnapshot(
        &self,
        _cgsnapshot: &CgSnapshot,
        _members: &[Share],
        _server: Option<&ShareServer>,
    ) -> Result<Vec<CgSnapshotMemberUpdate>> {
        unsupported(self.backend_name(), "consistency groups")
    }

    async fn delete_cgsnapshot(
        &self,
        _cgsnapshot: &CgSnapshot,
        _server: Option<&ShareServer>,
    ) -> Result<()> {
        unsupported(self.backend_name(), "consistency groups")
    }

    // -------------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------------

    /// Create `new_replica` on this backend from the context's active replica
    async fn create_replica(
        &self,
        _ctx: ReplicationContext<'_>,
        _new_replica: &Replica,
    ) -> Result<ReplicaUpdate> {
        unsupported(self.backend_name(), "replication")
    }

    async fn delete_replica(
        &self,
        _ctx: ReplicationContext<'_>,
        _replica: &Replica,
    ) -> Result<()> {
        unsupported(self.backend_name(), "replication")
    }

    /// Make `replica` active; returns the resulting state of every replica it touched
    async fn promote_replica(
        &self,
        _ctx: ReplicationContext<'_>,
        _replica: &Replica,
    ) -> Result<Vec<ReplicaStateUpdate>> {
        unsupported(self.backend_name(), "replication")
    }

    /// Poll the sync state of a non-active replica
    async fn update_replica_state(
        &self,
        _ctx: ReplicationContext<'_>,
        _replica: &Replica,
    ) -> Result<ReplicaState> {
        unsupported(self.backend_name(), "replication")
    }
}

/// Shared handle to a driver
pub type DriverRef = Arc<dyn ShareDriver>;

/// Pool a driver placed a share in; the pool component of the share's host
pub fn pool_of<'a>(backend: &str, share_host: Option<&'a PoolRef>) -> Result<&'a str> {
    match share_host {
        Some(host) if host.backend == backend => Ok(host.pool.as_str()),
        Some(host) => Err(Error::Internal(format!(
            "share host {} does not belong to backend {}",
            host, backend
        ))),
        None => Err(Error::Internal("share has no host".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_of() {
        let host = PoolRef::new("zfs1", "tank");
        assert_eq!(pool_of("zfs1", Some(&host)).unwrap(), "tank");
        assert!(pool_of("zfs2", Some(&host)).is_err());
        assert!(pool_of("zfs1", None).is_err());
    }

    #[test]
    fn test_default_capabilities_are_off() {
        let caps = DriverCapabilities::default();
        assert!(!caps.handles_share_servers);
        assert!(!caps.supports_cg);
        assert!(!caps.supports_replication);
        assert!(!caps.supports_snapshots);
    }
}
