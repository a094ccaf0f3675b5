//! Domain Model
//!
//! Records held by the state store: shares, snapshots, access rules,
//! replicas, consistency groups, share servers and share networks.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Generate a new resource identifier (UUID v4)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Pool Reference
// =============================================================================

/// Fully qualified pool location, rendered as `backend#pool`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolRef {
    pub backend: String,
    pub pool: String,
}

impl PoolRef {
    pub fn new(backend: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            pool: pool.into(),
        }
    }
}

impl std::fmt::Display for PoolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.backend, self.pool)
    }
}

impl FromStr for PoolRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('#') {
            Some((backend, pool)) if !backend.is_empty() && !pool.is_empty() => {
                Ok(PoolRef::new(backend, pool))
            }
            _ => Err(Error::InvalidRequest(format!(
                "invalid host '{}', expected backend#pool",
                s
            ))),
        }
    }
}

// =============================================================================
// Share
// =============================================================================

/// File sharing protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShareProtocol {
    Nfs,
    Cifs,
    Glusterfs,
    Hdfs,
    Cephfs,
}

impl ShareProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareProtocol::Nfs => "NFS",
            ShareProtocol::Cifs => "CIFS",
            ShareProtocol::Glusterfs => "GLUSTERFS",
            ShareProtocol::Hdfs => "HDFS",
            ShareProtocol::Cephfs => "CEPHFS",
        }
    }
}

impl std::fmt::Display for ShareProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShareProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "NFS" => Ok(ShareProtocol::Nfs),
            "CIFS" => Ok(ShareProtocol::Cifs),
            "GLUSTERFS" => Ok(ShareProtocol::Glusterfs),
            "HDFS" => Ok(ShareProtocol::Hdfs),
            "CEPHFS" => Ok(ShareProtocol::Cephfs),
            other => Err(Error::InvalidRequest(format!(
                "unsupported share protocol '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    Creating,
    Available,
    Error,
    Deleting,
    ErrorDeleting,
    Extending,
    ExtendingError,
    Shrinking,
    ShrinkingError,
    ShrinkingPossibleDataLossError,
    Managing,
    ErrorManaging,
    Unmanaging,
    ErrorUnmanaging,
    ReplicationChange,
}

impl ShareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareStatus::Creating => "creating",
            ShareStatus::Available => "available",
            ShareStatus::Error => "error",
            ShareStatus::Deleting => "deleting",
            ShareStatus::ErrorDeleting => "error_deleting",
            ShareStatus::Extending => "extending",
            ShareStatus::ExtendingError => "extending_error",
            ShareStatus::Shrinking => "shrinking",
            ShareStatus::ShrinkingError => "shrinking_error",
            ShareStatus::ShrinkingPossibleDataLossError => "shrinking_possible_data_loss_error",
            ShareStatus::Managing => "managing",
            ShareStatus::ErrorManaging => "error_managing",
            ShareStatus::Unmanaging => "unmanaging",
            ShareStatus::ErrorUnmanaging => "error_unmanaging",
            ShareStatus::ReplicationChange => "replication_change",
        }
    }

    /// Statuses that mean a lifecycle operation is in flight
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ShareStatus::Creating
                | ShareStatus::Deleting
                | ShareStatus::Extending
                | ShareStatus::Shrinking
                | ShareStatus::Managing
                | ShareStatus::Unmanaging
                | ShareStatus::ReplicationChange
        )
    }

    /// Statuses from which a share may be deleted
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            ShareStatus::Available
                | ShareStatus::Error
                | ShareStatus::ErrorDeleting
                | ShareStatus::ExtendingError
                | ShareStatus::ShrinkingError
                | ShareStatus::ShrinkingPossibleDataLossError
                | ShareStatus::ErrorManaging
                | ShareStatus::ErrorUnmanaging
        )
    }
}

impl std::fmt::Display for ShareStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication flavours a backend may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    Readable,
    Writable,
    Dr,
}

impl ReplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationType::Readable => "readable",
            ReplicationType::Writable => "writable",
            ReplicationType::Dr => "dr",
        }
    }
}

impl std::fmt::Display for ReplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "readable" => Ok(ReplicationType::Readable),
            "writable" => Ok(ReplicationType::Writable),
            "dr" => Ok(ReplicationType::Dr),
            other => Err(Error::InvalidExtraSpec {
                key: "replication_type".into(),
                reason: format!("unknown replication type '{}'", other),
            }),
        }
    }
}

/// A mount address for a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLocation {
    pub path: String,
    pub is_admin_only: bool,
    pub preferred: bool,
}

impl ExportLocation {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_admin_only: false,
            preferred: true,
        }
    }
}

/// A provisioned network file system export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub name: String,
    pub size_gb: u64,
    pub protocol: ShareProtocol,
    /// Share type name
    pub share_type: String,
    /// Copy of the share type's extra specs at creation time
    pub extra_specs: BTreeMap<String, String>,
    pub availability_zone: Option<String>,
    pub status: ShareStatus,
    pub status_reason: Option<String>,
    pub export_locations: Vec<ExportLocation>,
    pub snapshot_support: bool,
    /// Authoritative location; unset until scheduled
    pub host: Option<PoolRef>,
    pub share_network_id: Option<String>,
    pub share_server_id: Option<String>,
    pub consistency_group_id: Option<String>,
    /// Source snapshot when created from a snapshot
    pub snapshot_id: Option<String>,
    pub replication_type: Option<ReplicationType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Share {
    /// Move the share to a new status, recording the reason
    pub fn set_status(&mut self, status: ShareStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.updated_at = Utc::now();
    }

    /// Host or an error when the share was never scheduled
    pub fn require_host(&self) -> Result<&PoolRef> {
        self.host.as_ref().ok_or_else(|| {
            Error::invalid_state("Share", &self.id, "share has no host")
        })
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Status of a snapshot or consistency group snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Error,
    Deleting,
    ErrorDeleting,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Creating => "creating",
            SnapshotStatus::Available => "available",
            SnapshotStatus::Error => "error",
            SnapshotStatus::Deleting => "deleting",
            SnapshotStatus::ErrorDeleting => "error_deleting",
        }
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub share_id: String,
    pub name: String,
    pub size_gb: u64,
    pub status: SnapshotStatus,
    pub status_reason: Option<String>,
    /// Backend handle returned by the driver
    pub provider_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn set_status(&mut self, status: SnapshotStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Access Rules
// =============================================================================

/// How a client is identified by an access rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Ip,
    User,
    Cert,
    Cephx,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Ip => "ip",
            AccessType::User => "user",
            AccessType::Cert => "cert",
            AccessType::Cephx => "cephx",
        }
    }
}

impl std::fmt::Display for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ip" => Ok(AccessType::Ip),
            "user" => Ok(AccessType::User),
            "cert" => Ok(AccessType::Cert),
            "cephx" => Ok(AccessType::Cephx),
            other => Err(Error::InvalidShareAccess(format!(
                "unknown access type '{}'",
                other
            ))),
        }
    }
}

/// Access level granted by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Rw,
    Ro,
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessLevel::Rw => write!(f, "rw"),
            AccessLevel::Ro => write!(f, "ro"),
        }
    }
}

/// Whether the backend has applied the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessState {
    New,
    Active,
    Error,
}

/// Client access grant on a share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: String,
    pub share_id: String,
    pub access_type: AccessType,
    pub access_to: String,
    pub access_level: AccessLevel,
    pub state: AccessState,
    /// Secret handed back by backends that mint credentials (cephx)
    pub access_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Replicas
// =============================================================================

/// Lifecycle status of a replica record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Creating,
    Available,
    Error,
    Deleting,
    ErrorDeleting,
    ReplicationChange,
}

/// Data state of a replica relative to the active copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Active,
    InSync,
    OutOfSync,
    Error,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::InSync => write!(f, "in_sync"),
            ReplicaState::OutOfSync => write!(f, "out_of_sync"),
            ReplicaState::Error => write!(f, "error"),
        }
    }
}

/// Copy of a share on a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,
    pub share_id: String,
    pub host: PoolRef,
    pub availability_zone: Option<String>,
    pub status: ReplicaStatus,
    pub replica_state: ReplicaState,
    pub status_reason: Option<String>,
    pub export_locations: Vec<ExportLocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Replica {
    pub fn is_active(&self) -> bool {
        self.replica_state == ReplicaState::Active
    }

    pub fn set_status(&mut self, status: ReplicaStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Consistency Groups
// =============================================================================

/// Lifecycle status of a consistency group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyGroupStatus {
    Creating,
    Available,
    Error,
    Deleting,
}

/// Shares with all-or-nothing snapshot semantics, pinned to one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyGroup {
    pub id: String,
    pub name: String,
    /// Share type names members may use; empty allows any
    pub share_types: Vec<String>,
    pub host: Option<PoolRef>,
    pub availability_zone: Option<String>,
    pub share_network_id: Option<String>,
    pub share_server_id: Option<String>,
    pub status: ConsistencyGroupStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One share's part of a consistency group snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgSnapshotMember {
    pub id: String,
    pub share_id: String,
    pub size_gb: u64,
    pub status: SnapshotStatus,
    pub provider_location: Option<String>,
}

/// Snapshot of every member of a consistency group at one point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgSnapshot {
    pub id: String,
    pub consistency_group_id: String,
    pub name: String,
    pub status: SnapshotStatus,
    pub status_reason: Option<String>,
    pub members: Vec<CgSnapshotMember>,
    pub created_at: DateTime<Utc>,
}

impl CgSnapshot {
    /// Set the group and every member to the same status
    pub fn set_status_all(&mut self, status: SnapshotStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        for member in &mut self.members {
            member.status = status;
        }
    }
}

// =============================================================================
// Share Servers & Networks
// =============================================================================

/// Lifecycle status of a share server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareServerStatus {
    Creating,
    Active,
    Error,
    Deleting,
}

/// Per-tenant storage endpoint on a backend that handles share servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareServer {
    pub id: String,
    pub share_network_id: String,
    pub backend: String,
    pub status: ShareServerStatus,
    pub backend_details: BTreeMap<String, String>,
    /// Shares and consistency groups using this server
    pub references: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tenant network descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareNetwork {
    pub id: String,
    pub name: String,
    pub cidr: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_ref_parse_and_display() {
        let host: PoolRef = "cephfs1#cephfs".parse().unwrap();
        assert_eq!(host.backend, "cephfs1");
        assert_eq!(host.pool, "cephfs");
        assert_eq!(host.to_string(), "cephfs1#cephfs");

        assert!("cephfs1".parse::<PoolRef>().is_err());
        assert!("#pool".parse::<PoolRef>().is_err());
    }

    #[test]
    fn test_protocol_parse_is_case_insensitive() {
        assert_eq!("nfs".parse::<ShareProtocol>().unwrap(), ShareProtocol::Nfs);
        assert_eq!("CephFS".parse::<ShareProtocol>().unwrap(), ShareProtocol::Cephfs);
        assert!("smb3".parse::<ShareProtocol>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ShareStatus::ShrinkingPossibleDataLossError).unwrap();
        assert_eq!(json, "\"shrinking_possible_data_loss_error\"");
        assert_eq!(
            ShareStatus::ShrinkingPossibleDataLossError.as_str(),
            "shrinking_possible_data_loss_error"
        );
        assert!(ShareStatus::Extending.is_transitional());
        assert!(!ShareStatus::Available.is_transitional());
        assert!(ShareStatus::ErrorManaging.is_deletable());
    }
}
