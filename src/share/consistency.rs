//! Consistency Group Coordinator
//!
//! Consistency groups pin their member shares to one pool. A group snapshot
//! captures every member at one consistency point: it becomes `available`
//! only when the driver returned a snapshot for each member, otherwise the
//! whole group snapshot goes to `error` and the backend is asked to clean
//! up what it did create.

use super::retry::failure_reason;
use super::LifecycleContext;
use crate::domain::model::{
    new_id, CgSnapshot, CgSnapshotMember, ConsistencyGroup, ConsistencyGroupStatus, PoolRef,
    Share, ShareServer, ShareStatus, SnapshotStatus,
};
use crate::domain::ports::{CgSnapshotMemberUpdate, DriverRef};
use crate::error::{Error, Result};
use crate::events::ShareEvent;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

pub struct ConsistencyCoordinator {
    ctx: LifecycleContext,
}

impl ConsistencyCoordinator {
    pub fn new(ctx: LifecycleContext) -> Self {
        Self { ctx }
    }

    fn driver_for(&self, cg: &ConsistencyGroup) -> Result<(DriverRef, PoolRef)> {
        let host = cg.host.clone().ok_or_else(|| {
            Error::invalid_state("ConsistencyGroup", &cg.id, "group has not been scheduled")
        })?;
        let driver = self.ctx.drivers.get(&host.backend)?;
        if !driver.capabilities().supports_cg {
            return Err(Error::DriverCapability {
                backend: host.backend.clone(),
                capability: "consistency groups".into(),
            });
        }
        Ok((driver, host))
    }

    fn settle_group(
        &self,
        cg_id: &str,
        status: ConsistencyGroupStatus,
        reason: Option<String>,
    ) -> Result<ConsistencyGroup> {
        self.ctx.store.consistency_groups.modify(cg_id, |cg| {
            cg.status = status;
            cg.status_reason = reason;
        })
    }

    fn settle_cgsnapshot(
        &self,
        cgsnapshot_id: &str,
        status: SnapshotStatus,
        reason: Option<String>,
    ) -> Result<CgSnapshot> {
        let cgsnapshot = self
            .ctx
            .store
            .cgsnapshots
            .modify(cgsnapshot_id, |c| c.set_status_all(status, reason))?;
        self.ctx.events.publish(ShareEvent::CgSnapshotChanged {
            cgsnapshot_id: cgsnapshot_id.to_string(),
            status,
        });
        Ok(cgsnapshot)
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Create a scheduled group recorded as `creating`
    pub async fn create_group(&self, cg_id: &str) -> Result<ConsistencyGroup> {
        self.ctx
            .observed("create_consistency_group", self.create_group_inner(cg_id))
            .await
    }

    async fn create_group_inner(&self, cg_id: &str) -> Result<ConsistencyGroup> {
        let _guard = self.ctx.locks.lock(cg_id).await;
        let cg = self.ctx.store.consistency_groups.require(cg_id)?;
        if cg.status != ConsistencyGroupStatus::Creating {
            return Err(Error::invalid_state(
                "ConsistencyGroup",
                cg_id,
                "group is not being created",
            ));
        }

        let mut server: Option<ShareServer> = None;
        let result: Result<()> = async {
            let (driver, host) = self.driver_for(&cg)?;
            if driver.capabilities().handles_share_servers {
                let network = cg.share_network_id.as_deref().ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "backend {} handles share servers; a share network is required",
                        host.backend
                    ))
                })?;
                server = Some(self.ctx.servers.ensure_server(network, &host.backend, cg_id).await?);
            }
            self.ctx
                .retry
                .call(&host.backend, "create_consistency_group", || {
                    driver.create_consistency_group(&cg, server.as_ref())
                })
                .await
        }
        .await;

        match result {
            Ok(()) => {
                let server_id = server.map(|s| s.id);
                self.ctx.store.consistency_groups.modify(cg_id, |g| {
                    g.share_server_id = server_id;
                })?;
                info!("Consistency group {} available", cg_id);
                self.settle_group(cg_id, ConsistencyGroupStatus::Available, None)
            }
            Err(e) => {
                error!("Consistency group {} failed: {}", cg_id, e);
                self.settle_group(
                    cg_id,
                    ConsistencyGroupStatus::Error,
                    Some(failure_reason("create_consistency_group", &e)),
                )?;
                if let Some(server) = server {
                    self.ctx.servers.release(&server.id, cg_id).await?;
                }
                Err(e)
            }
        }
    }

    /// Delete an empty group
    pub async fn delete_group(&self, cg_id: &str) -> Result<()> {
        self.ctx
            .observed("delete_consistency_group", self.delete_group_inner(cg_id))
            .await
    }

    async fn delete_group_inner(&self, cg_id: &str) -> Result<()> {
        let _guard = self.ctx.locks.lock(cg_id).await;
        let cg = self.ctx.store.consistency_groups.require(cg_id)?;

        let members = self.ctx.store.members_of(cg_id);
        if !members.is_empty() {
            return Err(Error::invalid_state(
                "ConsistencyGroup",
                cg_id,
                format!("group still has {} member share(s)", members.len()),
            ));
        }
        if self
            .ctx
            .store
            .cgsnapshots
            .find(|c| c.consistency_group_id == cg_id)
            .is_some()
        {
            return Err(Error::invalid_state(
                "ConsistencyGroup",
                cg_id,
                "group still has snapshots",
            ));
        }
        if matches!(
            cg.status,
            ConsistencyGroupStatus::Creating | ConsistencyGroupStatus::Deleting
        ) {
            return Err(Error::invalid_state(
                "ConsistencyGroup",
                cg_id,
                "group is busy",
            ));
        }

        let backend = match cg.host {
            Some(_) => {
                let server = self.ctx.server_of(cg.share_server_id.as_deref())?;
                Some((self.driver_for(&cg)?, server))
            }
            None => None,
        };
        self.settle_group(cg_id, ConsistencyGroupStatus::Deleting, None)?;
        if let Some(((driver, host), server)) = backend {
            let result = self
                .ctx
                .retry
                .call(&host.backend, "delete_consistency_group", || {
                    driver.delete_consistency_group(&cg, server.as_ref())
                })
                .await;
            if let Err(e) = result {
                self.settle_group(
                    cg_id,
                    ConsistencyGroupStatus::Error,
                    Some(failure_reason("delete_consistency_group", &e)),
                )?;
                return Err(e);
            }
        }

        self.ctx.store.consistency_groups.remove(cg_id);
        if let Some(server_id) = &cg.share_server_id {
            self.ctx.servers.release(server_id, cg_id).await?;
        }
        info!("Consistency group {} deleted", cg_id);
        Ok(())
    }

    // =========================================================================
    // Group Snapshots
    // =========================================================================

    /// Snapshot every member of a group at one consistency point
    pub async fn create_cgsnapshot(&self, cgsnapshot_id: &str) -> Result<CgSnapshot> {
        self.ctx
            .observed("create_cgsnapshot", self.create_cgsnapshot_inner(cgsnapshot_id))
            .await
    }

    async fn create_cgsnapshot_inner(&self, cgsnapshot_id: &str) -> Result<CgSnapshot> {
        let cgsnapshot = self.ctx.store.cgsnapshots.require(cgsnapshot_id)?;
        if cgsnapshot.status != SnapshotStatus::Creating {
            return Err(Error::invalid_state(
                "CgSnapshot",
                cgsnapshot_id,
                "group snapshot is not being created",
            ));
        }
        let (_guards, cgsnapshot) = self.lock_members(&cgsnapshot).await?;

        let result: Result<(Vec<CgSnapshotMemberUpdate>, usize)> = async {
            let cg = self
                .ctx
                .store
                .consistency_groups
                .require(&cgsnapshot.consistency_group_id)?;
            if cg.status != ConsistencyGroupStatus::Available {
                return Err(Error::invalid_state(
                    "ConsistencyGroup",
                    &cg.id,
                    "group is not available",
                ));
            }

            let members = cgsnapshot
                .members
                .iter()
                .map(|m| self.ctx.store.shares.require(&m.share_id))
                .collect::<Result<Vec<Share>>>()?;
            if let Some(busy) = members.iter().find(|s| s.status != ShareStatus::Available) {
                return Err(Error::invalid_state(
                    "Share",
                    &busy.id,
                    format!("member is {}, not available", busy.status),
                ));
            }

            let (driver, host) = self.driver_for(&cg)?;
            let server = self.ctx.server_of(cg.share_server_id.as_deref())?;
            let updates = self
                .ctx
                .retry
                .call(&host.backend, "create_cgsnapshot", || {
                    driver.create_cgsnapshot(&cgsnapshot, &members, server.as_ref())
                })
                .await?;
            Ok((updates, cgsnapshot.members.len()))
        }
        .await;

        let (updates, expected) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Group snapshot {} failed: {}", cgsnapshot_id, e);
                self.settle_cgsnapshot(
                    cgsnapshot_id,
                    SnapshotStatus::Error,
                    Some(failure_reason("create_cgsnapshot", &e)),
                )?;
                return Err(e);
            }
        };

        let complete = updates.len() == expected
            && cgsnapshot
                .members
                .iter()
                .all(|m| updates.iter().any(|u| u.member_id == m.id));
        if !complete {
            let reason = format!(
                "backend returned {} of {} member snapshots",
                updates.len(),
                expected
            );
            error!("Group snapshot {} is partial: {}", cgsnapshot_id, reason);
            self.cleanup_partial(&cgsnapshot).await;
            self.settle_cgsnapshot(cgsnapshot_id, SnapshotStatus::Error, Some(reason.clone()))?;
            return Err(Error::ConsistencyGroupPartialFailure {
                cgsnapshot_id: cgsnapshot_id.to_string(),
                reason,
            });
        }

        self.ctx.store.cgsnapshots.modify(cgsnapshot_id, |c| {
            for member in &mut c.members {
                member.provider_location = updates
                    .iter()
                    .find(|u| u.member_id == member.id)
                    .and_then(|u| u.provider_location.clone());
            }
        })?;
        info!("Group snapshot {} available with {} members", cgsnapshot_id, expected);
        self.settle_cgsnapshot(cgsnapshot_id, SnapshotStatus::Available, None)
    }

    /// Lock the group and its current members, then align the record's
    /// member list with the shares that are in the group under the lock
    async fn lock_members(
        &self,
        cgsnapshot: &CgSnapshot,
    ) -> Result<(Vec<OwnedMutexGuard<()>>, CgSnapshot)> {
        let cg_id = &cgsnapshot.consistency_group_id;
        loop {
            let expected: Vec<String> = self
                .ctx
                .store
                .members_of(cg_id)
                .into_iter()
                .map(|s| s.id)
                .collect();
            let mut keys = expected.clone();
            keys.push(cg_id.clone());
            let guards = self.ctx.locks.lock_all(&keys).await;

            let members = self.ctx.store.members_of(cg_id);
            if !members.iter().map(|s| &s.id).eq(expected.iter()) {
                debug!("Membership of group {} changed while locking, retrying", cg_id);
                continue;
            }

            let synced = self.ctx.store.cgsnapshots.modify(&cgsnapshot.id, |c| {
                c.members
                    .retain(|m| members.iter().any(|s| s.id == m.share_id));
                for share in &members {
                    match c.members.iter_mut().find(|m| m.share_id == share.id) {
                        Some(member) => member.size_gb = share.size_gb,
                        None => c.members.push(CgSnapshotMember {
                            id: new_id(),
                            share_id: share.id.clone(),
                            size_gb: share.size_gb,
                            status: SnapshotStatus::Creating,
                            provider_location: None,
                        }),
                    }
                }
            })?;
            return Ok((guards, synced));
        }
    }

    /// Ask the backend to drop whatever a partial group snapshot created
    async fn cleanup_partial(&self, cgsnapshot: &CgSnapshot) {
        let cleanup: Result<()> = async {
            let cg = self
                .ctx
                .store
                .consistency_groups
                .require(&cgsnapshot.consistency_group_id)?;
            let (driver, host) = self.driver_for(&cg)?;
            let server = self.ctx.server_of(cg.share_server_id.as_deref())?;
            self.ctx
                .retry
                .call(&host.backend, "delete_cgsnapshot", || {
                    driver.delete_cgsnapshot(cgsnapshot, server.as_ref())
                })
                .await
        }
        .await;
        if let Err(e) = cleanup {
            warn!("Cleanup of partial group snapshot {} failed: {}", cgsnapshot.id, e);
        }
    }

    /// Delete a group snapshot and every member snapshot with it
    pub async fn delete_cgsnapshot(&self, cgsnapshot_id: &str) -> Result<()> {
        self.ctx
            .observed("delete_cgsnapshot", self.delete_cgsnapshot_inner(cgsnapshot_id))
            .await
    }

    async fn delete_cgsnapshot_inner(&self, cgsnapshot_id: &str) -> Result<()> {
        let cgsnapshot = self.ctx.store.cgsnapshots.require(cgsnapshot_id)?;
        let _guard = self.ctx.locks.lock(&cgsnapshot.consistency_group_id).await;

        let (cgsnapshot, ()) = self.ctx.store.cgsnapshots.update(cgsnapshot_id, |c| {
            if !matches!(
                c.status,
                SnapshotStatus::Available | SnapshotStatus::Error | SnapshotStatus::ErrorDeleting
            ) {
                return Err(Error::invalid_state(
                    "CgSnapshot",
                    &c.id,
                    format!("cannot delete a group snapshot in status {}", c.status),
                ));
            }
            c.set_status_all(SnapshotStatus::Deleting, None);
            Ok(())
        })?;

        let result: Result<()> = async {
            let cg = self
                .ctx
                .store
                .consistency_groups
                .require(&cgsnapshot.consistency_group_id)?;
            let (driver, host) = self.driver_for(&cg)?;
            let server = self.ctx.server_of(cg.share_server_id.as_deref())?;
            self.ctx
                .retry
                .call(&host.backend, "delete_cgsnapshot", || {
                    driver.delete_cgsnapshot(&cgsnapshot, server.as_ref())
                })
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.ctx.store.cgsnapshots.remove(cgsnapshot_id);
                info!("Group snapshot {} deleted", cgsnapshot_id);
                Ok(())
            }
            Err(e) => {
                self.settle_cgsnapshot(
                    cgsnapshot_id,
                    SnapshotStatus::ErrorDeleting,
                    Some(failure_reason("delete_cgsnapshot", &e)),
                )?;
                Err(e)
            }
        }
    }
}
