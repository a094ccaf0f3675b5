//! Replication Coordinator
//!
//! Replicas of a share live on pools in the same replication domain. The
//! share's original copy is registered as its first, active replica when
//! the share is created. New replicas start `out_of_sync` and move to
//! `in_sync` when a later poll confirms it. Promotion swaps the active
//! designation so that exactly one replica is active afterwards.

use super::retry::failure_reason;
use super::LifecycleContext;
use crate::domain::model::{new_id, PoolRef, Replica, ReplicaState, ReplicaStatus, ShareStatus};
use crate::domain::ports::{ReplicaUpdate, ReplicationContext};
use crate::error::{Error, Result};
use crate::events::ShareEvent;
use chrono::Utc;
use tracing::{error, info, warn};

pub struct ReplicationCoordinator {
    ctx: LifecycleContext,
}

impl ReplicationCoordinator {
    pub fn new(ctx: LifecycleContext) -> Self {
        Self { ctx }
    }

    fn set_state(
        &self,
        replica: &Replica,
        state: ReplicaState,
        status: ReplicaStatus,
        reason: Option<String>,
    ) -> Result<Replica> {
        let updated = self.ctx.store.replicas.modify(&replica.id, |r| {
            r.replica_state = state;
            r.set_status(status, reason);
        })?;
        if replica.replica_state != state {
            self.ctx.events.publish(ShareEvent::ReplicaStateChanged {
                share_id: replica.share_id.clone(),
                replica_id: replica.id.clone(),
                state,
            });
        }
        Ok(updated)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a replica recorded as `creating` on its scheduled pool
    pub async fn create_replica(&self, replica_id: &str) -> Result<Replica> {
        self.ctx
            .observed("create_replica", self.create_replica_inner(replica_id))
            .await
    }

    async fn create_replica_inner(&self, replica_id: &str) -> Result<Replica> {
        let replica = self.ctx.store.replicas.require(replica_id)?;
        let _guard = self.ctx.locks.lock(&replica.share_id).await;

        let result: Result<ReplicaUpdate> = async {
            let share = self.ctx.store.shares.require(&replica.share_id)?;
            if share.status != ShareStatus::Available {
                return Err(Error::invalid_state(
                    "Share",
                    &share.id,
                    format!("cannot replicate a share in status {}", share.status),
                ));
            }
            if share.replication_type.is_none() {
                return Err(Error::InvalidRequest(format!(
                    "share {} has a share type without replication",
                    share.id
                )));
            }
            let driver = self.ctx.drivers.get(&replica.host.backend)?;
            if !driver.capabilities().supports_replication {
                return Err(Error::DriverCapability {
                    backend: replica.host.backend.clone(),
                    capability: "replication".into(),
                });
            }

            let others: Vec<Replica> = self
                .ctx
                .store
                .replicas_of(&share.id)
                .into_iter()
                .filter(|r| r.id != replica.id)
                .collect();
            let rules = self.ctx.store.access_rules_of(&share.id);
            let view = self.ctx.driver_view(&share);
            let context = ReplicationContext {
                share: &view,
                replicas: &others,
                access_rules: &rules,
            };
            self.ctx
                .retry
                .call(&replica.host.backend, "create_replica", || {
                    driver.create_replica(context, &replica)
                })
                .await
        }
        .await;

        match result {
            Ok(update) => {
                let state = match update.replica_state {
                    ReplicaState::Active => ReplicaState::OutOfSync,
                    other => other,
                };
                self.ctx.store.replicas.modify(replica_id, |r| {
                    r.export_locations = update.export_locations;
                })?;
                info!("Replica {} created on {} ({})", replica_id, replica.host, state);
                self.set_state(&replica, state, ReplicaStatus::Available, None)
            }
            Err(e) => {
                error!("Replica {} failed: {}", replica_id, e);
                self.set_state(
                    &replica,
                    ReplicaState::Error,
                    ReplicaStatus::Error,
                    Some(failure_reason("create_replica", &e)),
                )?;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Ask the replica's backend for its sync state
    pub async fn update_replica(&self, replica_id: &str) -> Result<Replica> {
        let replica = self.ctx.store.replicas.require(replica_id)?;
        let _guard = self.ctx.locks.lock(&replica.share_id).await;

        let replica = self.ctx.store.replicas.require(replica_id)?;
        if replica.is_active() {
            return Ok(replica);
        }
        if replica.status != ReplicaStatus::Available {
            return Err(Error::invalid_state(
                "ShareReplica",
                replica_id,
                "replica is not available",
            ));
        }

        let share = self.ctx.store.shares.require(&replica.share_id)?;
        let driver = self.ctx.drivers.get(&replica.host.backend)?;
        let replicas = self.ctx.store.replicas_of(&share.id);
        let rules = self.ctx.store.access_rules_of(&share.id);
        let view = self.ctx.driver_view(&share);
        let context = ReplicationContext {
            share: &view,
            replicas: &replicas,
            access_rules: &rules,
        };

        let result = self
            .ctx
            .retry
            .call(&replica.host.backend, "update_replica_state", || {
                driver.update_replica_state(context, &replica)
            })
            .await;

        match result {
            Ok(ReplicaState::Active) => {
                warn!("Backend reported non-active replica {} as active", replica_id);
                self.set_state(&replica, ReplicaState::Error, ReplicaStatus::Available, None)
            }
            Ok(state) => self.set_state(&replica, state, ReplicaStatus::Available, None),
            Err(e) => {
                self.set_state(
                    &replica,
                    ReplicaState::Error,
                    ReplicaStatus::Available,
                    Some(failure_reason("update_replica_state", &e)),
                )?;
                Err(e)
            }
        }
    }

    /// Poll every non-active replica; returns how many polls succeeded
    pub async fn poll_all(&self) -> usize {
        let due = self
            .ctx
            .store
            .replicas
            .filter(|r| !r.is_active() && r.status == ReplicaStatus::Available);

        let mut updated = 0;
        for replica in due {
            match self.update_replica(&replica.id).await {
                Ok(_) => updated += 1,
                Err(e) => warn!("Polling replica {} failed: {}", replica.id, e),
            }
        }
        updated
    }

    // =========================================================================
    // Promote
    // =========================================================================

    /// Make a replica the active one
    ///
    /// Replicas that are not `in_sync` are promoted only with `force`;
    /// without it the call fails and nothing changes.
    pub async fn promote_replica(&self, replica_id: &str, force: bool) -> Result<Replica> {
        let replica = self.ctx.store.replicas.require(replica_id)?;
        let _guard = self.ctx.locks.lock(&replica.share_id).await;
        self.ctx
            .observed("promote_replica", self.promote_locked(replica_id, force))
            .await
    }

    async fn promote_locked(&self, replica_id: &str, force: bool) -> Result<Replica> {
        let replica = self.ctx.store.replicas.require(replica_id)?;
        if replica.is_active() {
            return Ok(replica);
        }
        if replica.status != ReplicaStatus::Available {
            return Err(Error::ReplicationPromotion {
                replica_id: replica_id.to_string(),
                reason: "replica is not available".into(),
            });
        }
        match replica.replica_state {
            ReplicaState::InSync => {}
            state if force => warn!("Force promoting replica {} in state {}", replica_id, state),
            state => {
                return Err(Error::ReplicationPromotion {
                    replica_id: replica_id.to_string(),
                    reason: format!("replica is {}; promotion requires force", state),
                })
            }
        }

        let driver = self.ctx.drivers.get(&replica.host.backend)?;
        if !driver.capabilities().supports_replication {
            return Err(Error::DriverCapability {
                backend: replica.host.backend.clone(),
                capability: "replication".into(),
            });
        }

        let (share, ()) = self.ctx.store.shares.update(&replica.share_id, |s| {
            if s.status != ShareStatus::Available {
                return Err(Error::invalid_state(
                    "Share",
                    &s.id,
                    format!("cannot promote while share is {}", s.status),
                ));
            }
            s.set_status(ShareStatus::ReplicationChange, None);
            Ok(())
        })?;
        self.ctx.store.replicas.modify(replica_id, |r| {
            r.set_status(ReplicaStatus::ReplicationChange, None)
        })?;

        let replicas = self.ctx.store.replicas_of(&share.id);
        let rules = self.ctx.store.access_rules_of(&share.id);
        let view = self.ctx.driver_view(&share);
        let context = ReplicationContext {
            share: &view,
            replicas: &replicas,
            access_rules: &rules,
        };
        let result = self
            .ctx
            .retry
            .call(&replica.host.backend, "promote_replica", || {
                driver.promote_replica(context, &replica)
            })
            .await;

        let updates = match result {
            Ok(updates) => updates,
            Err(e) => {
                error!("Promotion of replica {} failed: {}", replica_id, e);
                self.ctx.store.replicas.modify(replica_id, |r| {
                    r.set_status(ReplicaStatus::Error, Some(failure_reason("promote_replica", &e)))
                })?;
                self.ctx.store.shares.modify(&share.id, |s| {
                    s.set_status(ShareStatus::Available, None)
                })?;
                return Err(e);
            }
        };

        for other in replicas.iter().filter(|r| r.id != replica_id) {
            let reported = updates
                .iter()
                .find(|u| u.replica_id == other.id)
                .map(|u| u.replica_state);
            let state = match reported {
                Some(ReplicaState::Active) | None if other.is_active() => ReplicaState::OutOfSync,
                Some(ReplicaState::Active) => ReplicaState::OutOfSync,
                Some(state) => state,
                None => other.replica_state,
            };
            self.set_state(other, state, other.status, other.status_reason.clone())?;
        }
        let promoted =
            self.set_state(&replica, ReplicaState::Active, ReplicaStatus::Available, None)?;

        let share = self.ctx.store.shares.modify(&share.id, |s| {
            s.host = Some(promoted.host.clone());
            s.export_locations = promoted.export_locations.clone();
            s.set_status(ShareStatus::Available, None);
        })?;
        self.ctx
            .events
            .share_status(&share.id, ShareStatus::Available, None);
        info!("Replica {} is now active for share {}", replica_id, share.id);
        Ok(promoted)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a replica
    ///
    /// The active replica needs `force`, which first promotes the best
    /// remaining replica. The last replica of a share is never deleted
    /// here; delete the share instead.
    pub async fn delete_replica(&self, replica_id: &str, force: bool) -> Result<()> {
        let replica = self.ctx.store.replicas.require(replica_id)?;
        let _guard = self.ctx.locks.lock(&replica.share_id).await;
        self.ctx
            .observed("delete_replica", self.delete_locked(replica_id, force))
            .await
    }

    async fn delete_locked(&self, replica_id: &str, force: bool) -> Result<()> {
        let mut replica = self.ctx.store.replicas.require(replica_id)?;
        let siblings = self.ctx.store.replicas_of(&replica.share_id);
        if siblings.len() <= 1 {
            return Err(Error::invalid_state(
                "ShareReplica",
                replica_id,
                "cannot delete the only replica of a share; delete the share instead",
            ));
        }

        if replica.is_active() {
            if !force {
                return Err(Error::invalid_state(
                    "ShareReplica",
                    replica_id,
                    "cannot delete the active replica without force",
                ));
            }
            let successor = Self::best_successor(&siblings, replica_id).ok_or_else(|| {
                Error::invalid_state(
                    "ShareReplica",
                    replica_id,
                    "no available replica can take over",
                )
            })?;
            warn!(
                "Deleting active replica {}; promoting {} first, data may be lost",
                replica_id, successor.id
            );
            self.promote_locked(&successor.id, true).await?;
            replica = self.ctx.store.replicas.require(replica_id)?;
        }

        self.ctx
            .store
            .replicas
            .modify(replica_id, |r| r.set_status(ReplicaStatus::Deleting, None))?;

        let share = self.ctx.store.shares.require(&replica.share_id)?;
        let driver = self.ctx.drivers.get(&replica.host.backend)?;
        let replicas = self.ctx.store.replicas_of(&share.id);
        let rules = self.ctx.store.access_rules_of(&share.id);
        let view = self.ctx.driver_view(&share);
        let context = ReplicationContext {
            share: &view,
            replicas: &replicas,
            access_rules: &rules,
        };
        let result = self
            .ctx
            .retry
            .call(&replica.host.backend, "delete_replica", || {
                driver.delete_replica(context, &replica)
            })
            .await;

        match result {
            Ok(()) => {}
            Err(e) if force => {
                warn!("Backend delete of replica {} failed, removing anyway: {}", replica_id, e)
            }
            Err(e) => {
                self.ctx.store.replicas.modify(replica_id, |r| {
                    r.set_status(
                        ReplicaStatus::ErrorDeleting,
                        Some(failure_reason("delete_replica", &e)),
                    )
                })?;
                return Err(e);
            }
        }

        self.ctx.store.replicas.remove(replica_id);
        if !replica.export_locations.is_empty() {
            self.ctx.hosts.release(&replica.host, share.size_gb);
        }
        info!("Replica {} of share {} deleted", replica_id, share.id);
        Ok(())
    }

    /// Replica to promote in place of a deleted active one
    fn best_successor<'a>(replicas: &'a [Replica], excluding: &str) -> Option<&'a Replica> {
        let rank = |state: ReplicaState| match state {
            ReplicaState::InSync => 0,
            ReplicaState::OutOfSync => 1,
            _ => 2,
        };
        replicas
            .iter()
            .filter(|r| r.id != excluding && r.status == ReplicaStatus::Available)
            .min_by_key(|r| (rank(r.replica_state), r.created_at))
    }

    /// Record for a replica about to be scheduled
    pub fn new_replica(share_id: &str, host: PoolRef, zone: Option<String>) -> Replica {
        let now = Utc::now();
        Replica {
            id: new_id(),
            share_id: share_id.to_string(),
            host,
            availability_zone: zone,
            status: ReplicaStatus::Creating,
            replica_state: ReplicaState::OutOfSync,
            status_reason: None,
            export_locations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ReplicationType, Share};
    use crate::drivers::Fault;
    use crate::share::manager::ShareManager;
    use crate::share::testing::{backend, harness, placed_share, Harness};
    use assert_matches::assert_matches;

    async fn replicated_share(h: &Harness) -> Share {
        let manager = ShareManager::new(h.ctx.clone());
        let mut share = placed_share("p1", 1);
        share.replication_type = Some(ReplicationType::Readable);
        h.ctx.store.shares.insert(share.clone()).unwrap();
        manager.create_share(&share.id, true).await.unwrap()
    }

    async fn add_replica(
        h: &Harness,
        coordinator: &ReplicationCoordinator,
        share: &Share,
    ) -> Replica {
        let replica =
            ReplicationCoordinator::new_replica(&share.id, PoolRef::new("b1", "p2"), None);
        h.ctx.store.replicas.insert(replica.clone()).unwrap();
        coordinator.create_replica(&replica.id).await.unwrap()
    }

    fn active_count(h: &Harness, share_id: &str) -> usize {
        h.ctx
            .store
            .replicas_of(share_id)
            .iter()
            .filter(|r| r.is_active())
            .count()
    }

    #[tokio::test]
    async fn test_primary_registered_and_replica_syncs() {
        let h = harness(backend(Some("east"))).await;
        let coordinator = ReplicationCoordinator::new(h.ctx.clone());
        let share = replicated_share(&h).await;
        assert_eq!(active_count(&h, &share.id), 1);

        let replica = add_replica(&h, &coordinator, &share).await;
        assert_eq!(replica.replica_state, ReplicaState::OutOfSync);
        assert_eq!(replica.status, ReplicaStatus::Available);

        assert_eq!(coordinator.poll_all().await, 1);
        assert_eq!(
            h.ctx.store.replicas.require(&replica.id).unwrap().replica_state,
            ReplicaState::InSync
        );
    }

    #[tokio::test]
    async fn test_promote_out_of_sync_requires_force() {
        let h = harness(backend(Some("east"))).await;
        let coordinator = ReplicationCoordinator::new(h.ctx.clone());
        let share = replicated_share(&h).await;
        let replica = add_replica(&h, &coordinator, &share).await;

        assert_matches!(
            coordinator.promote_replica(&replica.id, false).await,
            Err(Error::ReplicationPromotion { .. })
        );
        let unchanged = h.ctx.store.replicas.require(&replica.id).unwrap();
        assert_eq!(unchanged.replica_state, ReplicaState::OutOfSync);
        assert!(h.ctx.store.replicas.require(&share.id).unwrap().is_active());
        assert_eq!(h.driver.call_count("promote_replica"), 0);

        let promoted = coordinator.promote_replica(&replica.id, true).await.unwrap();
        assert!(promoted.is_active());
        assert_eq!(active_count(&h, &share.id), 1);
    }

    #[tokio::test]
    async fn test_promotion_moves_share_host() {
        let h = harness(backend(Some("east"))).await;
        let coordinator = ReplicationCoordinator::new(h.ctx.clone());
        let share = replicated_share(&h).await;
        let replica = add_replica(&h, &coordinator, &share).await;
        coordinator.update_replica(&replica.id).await.unwrap();

        coordinator.promote_replica(&replica.id, false).await.unwrap();
        let share = h.ctx.store.shares.require(&share.id).unwrap();
        assert_eq!(share.host, Some(PoolRef::new("b1", "p2")));
        assert_eq!(share.status, ShareStatus::Available);
        assert_eq!(
            h.ctx.store.replicas.require(&share.id).unwrap().replica_state,
            ReplicaState::InSync
        );
        assert_eq!(active_count(&h, &share.id), 1);
    }

    #[tokio::test]
    async fn test_sole_replica_cannot_be_deleted() {
        let h = harness(backend(Some("east"))).await;
        let coordinator = ReplicationCoordinator::new(h.ctx.clone());
        let share = replicated_share(&h).await;

        for force in [false, true] {
            assert_matches!(
                coordinator.delete_replica(&share.id, force).await,
                Err(Error::InvalidState { .. })
            );
        }
        assert!(h.ctx.store.replicas.require(&share.id).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_force_delete_active_promotes_successor() {
        let h = harness(backend(Some("east"))).await;
        let coordinator = ReplicationCoordinator::new(h.ctx.clone());
        let share = replicated_share(&h).await;
        let replica = add_replica(&h, &coordinator, &share).await;

        assert_matches!(
            coordinator.delete_replica(&share.id, false).await,
            Err(Error::InvalidState { .. })
        );
        coordinator.delete_replica(&share.id, true).await.unwrap();

        let remaining = h.ctx.store.replicas_of(&share.id);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, replica.id);
        assert!(remaining[0].is_active());
    }

    #[tokio::test]
    async fn test_failed_replica_creation() {
        let h = harness(backend(Some("east"))).await;
        let coordinator = ReplicationCoordinator::new(h.ctx.clone());
        let share = replicated_share(&h).await;
        h.driver.inject_fault("create_replica", Fault::Fatal, 1);

        let replica =
            ReplicationCoordinator::new_replica(&share.id, PoolRef::new("b1", "p2"), None);
        h.ctx.store.replicas.insert(replica.clone()).unwrap();
        assert!(coordinator.create_replica(&replica.id).await.is_err());

        let stored = h.ctx.store.replicas.require(&replica.id).unwrap();
        assert_eq!(stored.status, ReplicaStatus::Error);
        assert_eq!(stored.replica_state, ReplicaState::Error);
    }
}
