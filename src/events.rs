//! Lifecycle Events
//!
//! Events emitted by the control plane for external consumers to react to
//! share lifecycle changes.

use crate::domain::{ReplicaState, ShareStatus, SnapshotStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted on lifecycle transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShareEvent {
    /// A share changed status
    ShareStatusChanged {
        share_id: String,
        status: ShareStatus,
        reason: Option<String>,
    },

    /// A share was removed from the store
    ShareDeleted { share_id: String },

    /// A snapshot changed status
    SnapshotStatusChanged {
        snapshot_id: String,
        status: SnapshotStatus,
    },

    /// An access rule was applied or failed
    AccessRuleChanged {
        share_id: String,
        rule_id: String,
        active: bool,
    },

    /// A replica's data state changed
    ReplicaStateChanged {
        share_id: String,
        replica_id: String,
        state: ReplicaState,
    },

    /// A share server was created or torn down
    ShareServerChanged { server_id: String, active: bool },

    /// A consistency group snapshot finished
    CgSnapshotChanged {
        cgsnapshot_id: String,
        status: SnapshotStatus,
    },

    /// A backend's pools were refreshed
    CapabilitiesRefreshed { backend: String, pools: usize },
}

impl ShareEvent {
    /// Get the share ID associated with this event
    pub fn share_id(&self) -> Option<&str> {
        match self {
            ShareEvent::ShareStatusChanged { share_id, .. }
            | ShareEvent::ShareDeleted { share_id }
            | ShareEvent::AccessRuleChanged { share_id, .. }
            | ShareEvent::ReplicaStateChanged { share_id, .. } => Some(share_id),
            _ => None,
        }
    }
}

/// Broadcast channel for [`ShareEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ShareEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.sender.subscribe()
    }

    /// Send an event; no receivers is fine
    pub fn publish(&self, event: ShareEvent) {
        let _ = self.sender.send(event);
    }

    pub fn share_status(&self, share_id: &str, status: ShareStatus, reason: Option<String>) {
        self.publish(ShareEvent::ShareStatusChanged {
            share_id: share_id.to_string(),
            status,
            reason,
        });
    }
}
