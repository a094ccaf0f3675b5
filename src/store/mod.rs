//! State Store
//!
//! In-process persistence for every control plane record, one sharded
//! [`Table`] per record kind.

pub mod table;

pub use table::{Record, Table, TableStatsSnapshot, TABLE_SHARD_COUNT};

use crate::domain::{
    AccessRule, CgSnapshot, ConsistencyGroup, Replica, Share, ShareNetwork, ShareServer,
    ShareType, Snapshot,
};
use std::sync::Arc;

macro_rules! impl_record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

impl_record!(Share, "Share");
impl_record!(Snapshot, "Snapshot");
impl_record!(AccessRule, "AccessRule");
impl_record!(Replica, "ShareReplica");
impl_record!(ShareType, "ShareType");
impl_record!(ShareNetwork, "ShareNetwork");
impl_record!(ShareServer, "ShareServer");
impl_record!(ConsistencyGroup, "ConsistencyGroup");
impl_record!(CgSnapshot, "CgSnapshot");

/// All tables of the control plane
#[derive(Debug, Default)]
pub struct StateStore {
    pub shares: Table<Share>,
    pub snapshots: Table<Snapshot>,
    pub access_rules: Table<AccessRule>,
    pub replicas: Table<Replica>,
    pub share_types: Table<ShareType>,
    pub share_networks: Table<ShareNetwork>,
    pub share_servers: Table<ShareServer>,
    pub consistency_groups: Table<ConsistencyGroup>,
    pub cgsnapshots: Table<CgSnapshot>,
}

impl StateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Share type by name
    pub fn share_type_by_name(&self, name: &str) -> Option<ShareType> {
        self.share_types.find(|t| t.name == name)
    }

    pub fn snapshots_of(&self, share_id: &str) -> Vec<Snapshot> {
        self.snapshots.filter(|s| s.share_id == share_id)
    }

    pub fn access_rules_of(&self, share_id: &str) -> Vec<AccessRule> {
        self.access_rules.filter(|r| r.share_id == share_id)
    }

    /// Replicas of a share, active first
    pub fn replicas_of(&self, share_id: &str) -> Vec<Replica> {
        let mut replicas = self.replicas.filter(|r| r.share_id == share_id);
        replicas.sort_by(|a, b| {
            b.is_active()
                .cmp(&a.is_active())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        replicas
    }

    pub fn members_of(&self, cg_id: &str) -> Vec<Share> {
        let mut members = self
            .shares
            .filter(|s| s.consistency_group_id.as_deref() == Some(cg_id));
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Whether any consistency group snapshot captured this share
    pub fn in_cgsnapshot(&self, share_id: &str) -> bool {
        self.cgsnapshots
            .find(|c| c.members.iter().any(|m| m.share_id == share_id))
            .is_some()
    }
}
