//! Share Manager
//!
//! Drives shares through their lifecycle:
//!
//! ```text
//! creating ──► available ──► extending ──► available | extending_error
//!    │            │     ├──► shrinking ──► available | shrinking_error
//!    ▼            │     │                   | shrinking_possible_data_loss_error
//!  error          │     ├──► unmanaging ──► (removed) | error_unmanaging
//!                 │     └──► deleting ───► (removed) | error_deleting
//! managing ──► available | error_managing
//! ```
//!
//! Transitions happen only on driver outcomes. Each operation holds the
//! share's lock and checks the starting status with a compare-and-swap.

use super::retry::failure_reason;
use super::LifecycleContext;
use crate::domain::model::{
    AccessState, ExportLocation, PoolRef, Replica, ReplicaState, ReplicaStatus, Share,
    ShareServer, ShareStatus, Snapshot, SnapshotStatus,
};
use crate::domain::ports::{DriverRef, ManagedShare};
use crate::error::{Error, ErrorAction, Result};
use crate::events::ShareEvent;
use crate::scheduler::Reservation;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

pub struct ShareManager {
    ctx: LifecycleContext,
}

impl ShareManager {
    pub fn new(ctx: LifecycleContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &LifecycleContext {
        &self.ctx
    }

    // =========================================================================
    // Status helpers
    // =========================================================================

    /// Move a share from an allowed status to `to`
    fn transition<P>(
        &self,
        share_id: &str,
        allowed: P,
        to: ShareStatus,
        operation: &str,
    ) -> Result<Share>
    where
        P: Fn(ShareStatus) -> bool,
    {
        let (share, ()) = self.ctx.store.shares.update(share_id, |share| {
            if !allowed(share.status) {
                return Err(Error::invalid_state(
                    "Share",
                    &share.id,
                    format!("cannot {} a share in status {}", operation, share.status),
                ));
            }
            share.set_status(to, None);
            Ok(())
        })?;
        self.ctx.events.share_status(&share.id, to, None);
        Ok(share)
    }

    /// Settle a share in its final status for this operation
    fn settle<F>(
        &self,
        share_id: &str,
        status: ShareStatus,
        reason: Option<String>,
        f: F,
    ) -> Result<Share>
    where
        F: FnOnce(&mut Share),
    {
        let share = self.ctx.store.shares.modify(share_id, |share| {
            f(share);
            share.set_status(status, reason.clone());
        })?;
        self.ctx.events.share_status(share_id, status, reason);
        Ok(share)
    }

    fn fail(&self, share_id: &str, status: ShareStatus, operation: &str, e: &Error) {
        match e.action() {
            ErrorAction::Surface => warn!("Share {} {} refused: {}", share_id, operation, e),
            _ => error!("Share {} {} failed: {}", share_id, operation, e),
        }
        let reason = Some(failure_reason(operation, e));
        if let Err(store_err) = self.settle(share_id, status, reason, |_| {}) {
            warn!("Could not record failure of share {}: {}", share_id, store_err);
        }
    }

    fn driver_for(&self, share: &Share) -> Result<(DriverRef, PoolRef)> {
        let host = share.require_host()?.clone();
        Ok((self.ctx.drivers.get(&host.backend)?, host))
    }

    // =========================================================================
    // Create / Delete
    // =========================================================================

    /// Create a scheduled share on its host
    ///
    /// On failure the share stays `creating` unless this is the last
    /// placement attempt, in which case it goes to `error`.
    pub async fn create_share(&self, share_id: &str, final_attempt: bool) -> Result<Share> {
        self.ctx
            .observed("create_share", self.create_share_inner(share_id, final_attempt))
            .await
    }

    async fn create_share_inner(&self, share_id: &str, final_attempt: bool) -> Result<Share> {
        let _guard = self.ctx.locks.lock(share_id).await;
        let share = self.ctx.store.shares.require(share_id)?;
        if share.status != ShareStatus::Creating {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                format!("expected creating, found {}", share.status),
            ));
        }

        match self.provision(&share).await {
            Ok((exports, server)) => {
                let server_id = server.map(|s| s.id);
                let share = self.settle(share_id, ShareStatus::Available, None, |s| {
                    s.export_locations = exports;
                    s.share_server_id = server_id;
                })?;
                if share.replication_type.is_some() {
                    self.register_primary(&share)?;
                }
                info!("Share {} available on {}", share.id, share.require_host()?);
                Ok(share)
            }
            Err(e) if final_attempt => {
                self.fail(share_id, ShareStatus::Error, "create_share", &e);
                Err(e)
            }
            Err(e) => {
                warn!("Share {} create attempt failed: {}", share_id, e);
                self.ctx.store.shares.modify(share_id, |s| {
                    s.status_reason = Some(failure_reason("create_share", &e));
                })?;
                Err(e)
            }
        }
    }

    async fn provision(&self, share: &Share) -> Result<(Vec<ExportLocation>, Option<ShareServer>)> {
        let (driver, host) = self.driver_for(share)?;
        let caps = driver.capabilities();
        let snapshot = share
            .snapshot_id
            .as_deref()
            .map(|id| self.ctx.store.snapshots.require(id))
            .transpose()?;

        let server = if caps.handles_share_servers {
            let network = share.share_network_id.as_deref().ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "backend {} handles share servers and needs a share network",
                    host.backend
                ))
            })?;
            Some(self.ctx.servers.ensure_server(network, &host.backend, &share.id).await?)
        } else {
            None
        };

        let result = match &snapshot {
            Some(_) if !caps.supports_create_from_snapshot => Err(Error::DriverCapability {
                backend: host.backend.clone(),
                capability: "create_share_from_snapshot".into(),
            }),
            Some(snapshot) => {
                self.ctx
                    .retry
                    .call(&host.backend, "create_share_from_snapshot", || {
                        driver.create_share_from_snapshot(share, snapshot, server.as_ref())
                    })
                    .await
            }
            None => {
                self.ctx
                    .retry
                    .call(&host.backend, "create_share", || {
                        driver.create_share(share, server.as_ref())
                    })
                    .await
            }
        };

        match result {
            Ok(exports) => Ok((exports, server)),
            Err(e) => {
                if let Some(server) = &server {
                    let released = self.ctx.servers.release(&server.id, &share.id).await;
                    if let Err(release_err) = released {
                        warn!("Releasing share server {} failed: {}", server.id, release_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Record the original copy of a replicated share as its active replica
    fn register_primary(&self, share: &Share) -> Result<Replica> {
        let now = Utc::now();
        let replica = Replica {
            id: share.id.clone(),
            share_id: share.id.clone(),
            host: share.require_host()?.clone(),
            availability_zone: share.availability_zone.clone(),
            status: ReplicaStatus::Available,
            replica_state: ReplicaState::Active,
            status_reason: None,
            export_locations: share.export_locations.clone(),
            created_at: now,
            updated_at: now,
        };
        self.ctx.store.replicas.insert(replica.clone())?;
        Ok(replica)
    }

    /// Delete a share and its backend data
    pub async fn delete_share(&self, share_id: &str) -> Result<()> {
        self.ctx
            .observed("delete_share", self.delete_share_inner(share_id))
            .await
    }

    async fn delete_share_inner(&self, share_id: &str) -> Result<()> {
        let guard = self.ctx.locks.lock(share_id).await;
        let store = &self.ctx.store;

        if !store.snapshots_of(share_id).is_empty() {
            return Err(Error::invalid_state("Share", share_id, "share has snapshots"));
        }
        if store.in_cgsnapshot(share_id) {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                "share is part of a consistency group snapshot",
            ));
        }
        if store.replicas_of(share_id).iter().any(|r| !r.is_active()) {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                "share has replicas; delete them first",
            ));
        }

        let share =
            self.transition(share_id, |s| s.is_deletable(), ShareStatus::Deleting, "delete")?;

        if share.host.is_some() {
            let (driver, host) = self.driver_for(&share)?;
            let server = self.ctx.server_of(share.share_server_id.as_deref())?;
            let view = self.ctx.driver_view(&share);
            let result = self
                .ctx
                .retry
                .call(&host.backend, "delete_share", || {
                    driver.delete_share(&view, server.as_ref())
                })
                .await;
            if let Err(e) = result {
                self.fail(share_id, ShareStatus::ErrorDeleting, "delete_share", &e);
                return Err(e);
            }
            if !share.export_locations.is_empty() {
                self.ctx.hosts.release(&host, share.size_gb);
            }
        }

        self.forget_share(&share);
        drop(guard);
        self.ctx.locks.forget(share_id);

        if let Some(server_id) = &share.share_server_id {
            self.ctx.servers.release(server_id, share_id).await?;
        }
        info!("Share {} deleted", share_id);
        Ok(())
    }

    /// Drop a share and its dependent records from the store
    fn forget_share(&self, share: &Share) {
        let store = &self.ctx.store;
        for rule in store.access_rules_of(&share.id) {
            store.access_rules.remove(&rule.id);
        }
        for replica in store.replicas_of(&share.id) {
            store.replicas.remove(&replica.id);
        }
        store.shares.remove(&share.id);
        self.ctx.events.publish(ShareEvent::ShareDeleted {
            share_id: share.id.clone(),
        });
    }

    // =========================================================================
    // Extend / Shrink
    // =========================================================================

    /// Grow a share; the extra capacity is reserved on its pool first
    pub async fn extend_share(&self, share_id: &str, new_size_gb: u64) -> Result<Share> {
        self.ctx
            .observed("extend_share", self.extend_share_inner(share_id, new_size_gb))
            .await
    }

    async fn extend_share_inner(&self, share_id: &str, new_size_gb: u64) -> Result<Share> {
        let _guard = self.ctx.locks.lock(share_id).await;
        let current = self.ctx.store.shares.require(share_id)?;
        if new_size_gb <= current.size_gb {
            return Err(Error::InvalidRequest(format!(
                "new size {} must be greater than current size {}",
                new_size_gb, current.size_gb
            )));
        }
        if current.status != ShareStatus::Available {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                format!("cannot extend a share in status {}", current.status),
            ));
        }

        let (driver, host) = self.driver_for(&current)?;
        let reservation: Reservation = self
            .ctx
            .hosts
            .reserve(&host, new_size_gb - current.size_gb)?;

        let share = match self.transition(
            share_id,
            |s| s == ShareStatus::Available,
            ShareStatus::Extending,
            "extend",
        ) {
            Ok(share) => share,
            Err(e) => {
                self.ctx.hosts.rollback(&reservation);
                return Err(e);
            }
        };

        let server = self.ctx.server_of(share.share_server_id.as_deref())?;
        let view = self.ctx.driver_view(&share);
        let result = self
            .ctx
            .retry
            .call(&host.backend, "extend_share", || {
                driver.extend_share(&view, new_size_gb, server.as_ref())
            })
            .await;

        match result {
            Ok(()) => {
                self.ctx.hosts.confirm(&reservation);
                info!("Share {} extended to {}G", share_id, new_size_gb);
                self.settle(share_id, ShareStatus::Available, None, |s| {
                    s.size_gb = new_size_gb
                })
            }
            Err(e) => {
                self.ctx.hosts.rollback(&reservation);
                self.fail(share_id, ShareStatus::ExtendingError, "extend_share", &e);
                Err(e)
            }
        }
    }

    /// Shrink a share; refused by the driver when data would not fit
    pub async fn shrink_share(&self, share_id: &str, new_size_gb: u64) -> Result<Share> {
        self.ctx
            .observed("shrink_share", self.shrink_share_inner(share_id, new_size_gb))
            .await
    }

    async fn shrink_share_inner(&self, share_id: &str, new_size_gb: u64) -> Result<Share> {
        let _guard = self.ctx.locks.lock(share_id).await;
        let current = self.ctx.store.shares.require(share_id)?;
        if new_size_gb == 0 || new_size_gb >= current.size_gb {
            return Err(Error::InvalidRequest(format!(
                "new size {} must be between 1 and {}",
                new_size_gb,
                current.size_gb.saturating_sub(1)
            )));
        }

        let share = self.transition(
            share_id,
            |s| s == ShareStatus::Available,
            ShareStatus::Shrinking,
            "shrink",
        )?;
        let (driver, host) = self.driver_for(&share)?;
        let server = self.ctx.server_of(share.share_server_id.as_deref())?;
        let view = self.ctx.driver_view(&share);
        let result = self
            .ctx
            .retry
            .call(&host.backend, "shrink_share", || {
                driver.shrink_share(&view, new_size_gb, server.as_ref())
            })
            .await;

        match result {
            Ok(()) => {
                self.ctx.hosts.release(&host, share.size_gb - new_size_gb);
                info!("Share {} shrunk to {}G", share_id, new_size_gb);
                self.settle(share_id, ShareStatus::Available, None, |s| {
                    s.size_gb = new_size_gb
                })
            }
            Err(e @ Error::ShrinkPossibleDataLoss { .. }) => {
                self.fail(
                    share_id,
                    ShareStatus::ShrinkingPossibleDataLossError,
                    "shrink_share",
                    &e,
                );
                Err(e)
            }
            Err(e) => {
                self.fail(share_id, ShareStatus::ShrinkingError, "shrink_share", &e);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Manage / Unmanage
    // =========================================================================

    /// Adopt an existing backend share into a `managing` share record
    ///
    /// On failure the share goes to `error_managing` with size 1.
    pub async fn manage_share(
        &self,
        share_id: &str,
        export_path: &str,
        driver_options: &BTreeMap<String, String>,
    ) -> Result<Share> {
        self.ctx
            .observed(
                "manage_share",
                self.manage_share_inner(share_id, export_path, driver_options),
            )
            .await
    }

    async fn manage_share_inner(
        &self,
        share_id: &str,
        export_path: &str,
        driver_options: &BTreeMap<String, String>,
    ) -> Result<Share> {
        let _guard = self.ctx.locks.lock(share_id).await;
        let share = self.ctx.store.shares.require(share_id)?;
        if share.status != ShareStatus::Managing {
            return Err(Error::invalid_state(
                "Share",
                share_id,
                format!("expected managing, found {}", share.status),
            ));
        }

        let result: Result<(ManagedShare, PoolRef)> = async {
            let (driver, host) = self.driver_for(&share)?;
            let caps = driver.capabilities();
            if caps.handles_share_servers {
                return Err(Error::InvalidRequest(format!(
                    "backend {} handles share servers; manage is not supported",
                    host.backend
                )));
            }
            if !caps.supports_manage {
                return Err(Error::DriverCapability {
                    backend: host.backend.clone(),
                    capability: "manage".into(),
                });
            }
            let managed = self
                .ctx
                .retry
                .call(&host.backend, "manage_existing", || {
                    driver.manage_existing(&share, export_path, driver_options)
                })
                .await?;
            Ok((managed, host))
        }
        .await;

        match result {
            Ok((managed, host)) => {
                self.ctx.hosts.consume(&host, managed.size_gb);
                info!("Managed {} as share {} ({}G)", export_path, share_id, managed.size_gb);
                self.settle(share_id, ShareStatus::Available, None, |s| {
                    s.size_gb = managed.size_gb;
                    s.export_locations = managed.export_locations;
                })
            }
            Err(e) => {
                error!("Managing {} failed: {}", export_path, e);
                self.settle(
                    share_id,
                    ShareStatus::ErrorManaging,
                    Some(failure_reason("manage_share", &e)),
                    |s| s.size_gb = 1,
                )?;
                Err(e)
            }
        }
    }

    /// Release a share from management, leaving its data on the backend
    pub async fn unmanage_share(&self, share_id: &str) -> Result<()> {
        self.ctx
            .observed("unmanage_share", self.unmanage_share_inner(share_id))
            .await
    }

    async fn unmanage_share_inner(&self, share_id: &str) -> Result<()> {
        let guard = self.ctx.locks.lock(share_id).await;
        let current = self.ctx.store.shares.require(share_id)?;
        let (driver, host) = self.driver_for(&current)?;

        if driver.capabilities().handles_share_servers {
            return Err(Error::InvalidRequest(format!(
                "backend {} handles share servers; unmanage is not supported",
                host.backend
            )));
        }
        if !self.ctx.store.snapshots_of(share_id).is_empty() {
            return Err(Error::invalid_state("Share", share_id, "share has snapshots"));
        }
        if self.ctx.store.replicas_of(share_id).len() > 1 {
            return Err(Error::invalid_state("Share", share_id, "share has replicas"));
        }

        let share = self.transition(
            share_id,
            |s| s == ShareStatus::Available,
            ShareStatus::Unmanaging,
            "unmanage",
        )?;
        let view = self.ctx.driver_view(&share);

        let result: Result<()> = async {
            if self.ctx.config.unmanage_remove_access_rules {
                for rule in self.ctx.store.access_rules_of(share_id) {
                    self.ctx
                        .retry
                        .call(&host.backend, "deny_access", || {
                            driver.deny_access(&view, &rule, None)
                        })
                        .await?;
                }
            }
            self.ctx
                .retry
                .call(&host.backend, "unmanage", || driver.unmanage(&view))
                .await
        }
        .await;

        if let Err(e) = result {
            self.fail(share_id, ShareStatus::ErrorUnmanaging, "unmanage_share", &e);
            return Err(e);
        }

        self.ctx.hosts.release(&host, share.size_gb);
        self.forget_share(&share);
        drop(guard);
        self.ctx.locks.forget(share_id);
        info!("Share {} unmanaged", share_id);
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    fn settle_snapshot(
        &self,
        snapshot_id: &str,
        status: SnapshotStatus,
        reason: Option<String>,
    ) -> Result<Snapshot> {
        let snapshot = self
            .ctx
            .store
            .snapshots
            .modify(snapshot_id, |s| s.set_status(status, reason))?;
        self.ctx.events.publish(ShareEvent::SnapshotStatusChanged {
            snapshot_id: snapshot_id.to_string(),
            status,
        });
        Ok(snapshot)
    }

    /// Take a snapshot recorded as `creating`
    pub async fn create_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.ctx
            .observed("create_snapshot", self.create_snapshot_inner(snapshot_id))
            .await
    }

    async fn create_snapshot_inner(&self, snapshot_id: &str) -> Result<Snapshot> {
        let snapshot = self.ctx.store.snapshots.require(snapshot_id)?;
        let _guard = self.ctx.locks.lock(&snapshot.share_id).await;

        let result: Result<Option<String>> = async {
            let share = self.ctx.store.shares.require(&snapshot.share_id)?;
            if share.status != ShareStatus::Available {
                return Err(Error::invalid_state(
                    "Share",
                    &share.id,
                    format!("cannot snapshot a share in status {}", share.status),
                ));
            }
            let (driver, host) = self.driver_for(&share)?;
            if !share.snapshot_support || !driver.capabilities().supports_snapshots {
                return Err(Error::DriverCapability {
                    backend: host.backend,
                    capability: "snapshots".into(),
                });
            }
            let server = self.ctx.server_of(share.share_server_id.as_deref())?;
            let view = self.ctx.driver_view(&share);
            self.ctx
                .retry
                .call(&host.backend, "create_snapshot", || {
                    driver.create_snapshot(&snapshot, &view, server.as_ref())
                })
                .await
        }
        .await;

        match result {
            Ok(location) => {
                self.ctx
                    .store
                    .snapshots
                    .modify(snapshot_id, |s| s.provider_location = location)?;
                info!("Snapshot {} available", snapshot_id);
                self.settle_snapshot(snapshot_id, SnapshotStatus::Available, None)
            }
            Err(e) => {
                error!("Snapshot {} failed: {}", snapshot_id, e);
                self.settle_snapshot(
                    snapshot_id,
                    SnapshotStatus::Error,
                    Some(failure_reason("create_snapshot", &e)),
                )?;
                Err(e)
            }
        }
    }

    /// Delete a snapshot; failure leaves `error_deleting`
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.ctx
            .observed("delete_snapshot", self.delete_snapshot_inner(snapshot_id))
            .await
    }

    async fn delete_snapshot_inner(&self, snapshot_id: &str) -> Result<()> {
        let current = self.ctx.store.snapshots.require(snapshot_id)?;
        let _guard = self.ctx.locks.lock(&current.share_id).await;

        let (snapshot, ()) = self.ctx.store.snapshots.update(snapshot_id, |s| {
            if !matches!(
                s.status,
                SnapshotStatus::Available | SnapshotStatus::Error | SnapshotStatus::ErrorDeleting
            ) {
                return Err(Error::invalid_state(
                    "Snapshot",
                    &s.id,
                    format!("cannot delete a snapshot in status {}", s.status),
                ));
            }
            s.set_status(SnapshotStatus::Deleting, None);
            Ok(())
        })?;

        let share = self.ctx.store.shares.require(&snapshot.share_id)?;
        let (driver, host) = self.driver_for(&share)?;
        let server = self.ctx.server_of(share.share_server_id.as_deref())?;
        let view = self.ctx.driver_view(&share);
        let result = self
            .ctx
            .retry
            .call(&host.backend, "delete_snapshot", || {
                driver.delete_snapshot(&snapshot, &view, server.as_ref())
            })
            .await;

        match result {
            Ok(()) => {
                self.ctx.store.snapshots.remove(snapshot_id);
                info!("Snapshot {} deleted", snapshot_id);
                Ok(())
            }
            Err(e) => {
                self.settle_snapshot(
                    snapshot_id,
                    SnapshotStatus::ErrorDeleting,
                    Some(failure_reason("delete_snapshot", &e)),
                )?;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Access Rules
    // =========================================================================

    fn settle_rule(
        &self,
        share_id: &str,
        rule_id: &str,
        state: AccessState,
        key: Option<String>,
    ) -> Result<()> {
        self.ctx.store.access_rules.modify(rule_id, |r| {
            r.state = state;
            if key.is_some() {
                r.access_key = key;
            }
        })?;
        self.ctx.events.publish(ShareEvent::AccessRuleChanged {
            share_id: share_id.to_string(),
            rule_id: rule_id.to_string(),
            active: state == AccessState::Active,
        });
        Ok(())
    }

    /// Apply a rule recorded as `new`
    pub async fn allow_access(&self, rule_id: &str) -> Result<()> {
        self.ctx
            .observed("allow_access", self.allow_access_inner(rule_id))
            .await
    }

    async fn allow_access_inner(&self, rule_id: &str) -> Result<()> {
        let rule = self.ctx.store.access_rules.require(rule_id)?;
        let _guard = self.ctx.locks.lock(&rule.share_id).await;

        let result: Result<Option<String>> = async {
            let share = self.ctx.store.shares.require(&rule.share_id)?;
            if share.status != ShareStatus::Available {
                return Err(Error::invalid_state(
                    "Share",
                    &share.id,
                    format!("cannot change access while {}", share.status),
                ));
            }
            let (driver, host) = self.driver_for(&share)?;
            let server = self.ctx.server_of(share.share_server_id.as_deref())?;
            let view = self.ctx.driver_view(&share);
            self.ctx
                .retry
                .call(&host.backend, "allow_access", || {
                    driver.allow_access(&view, &rule, server.as_ref())
                })
                .await
        }
        .await;

        match result {
            Ok(key) => {
                info!("Access {} -> {} active", rule.access_to, rule.share_id);
                self.settle_rule(&rule.share_id, rule_id, AccessState::Active, key)
            }
            Err(e) => {
                error!("Access rule {} failed: {}", rule_id, e);
                self.settle_rule(&rule.share_id, rule_id, AccessState::Error, None)?;
                Err(e)
            }
        }
    }

    /// Revoke and remove a rule
    pub async fn deny_access(&self, rule_id: &str) -> Result<()> {
        self.ctx
            .observed("deny_access", self.deny_access_inner(rule_id))
            .await
    }

    async fn deny_access_inner(&self, rule_id: &str) -> Result<()> {
        let rule = self.ctx.store.access_rules.require(rule_id)?;
        let _guard = self.ctx.locks.lock(&rule.share_id).await;

        let share = self.ctx.store.shares.require(&rule.share_id)?;
        let (driver, host) = self.driver_for(&share)?;
        let server = self.ctx.server_of(share.share_server_id.as_deref())?;
        let view = self.ctx.driver_view(&share);
        let result = self
            .ctx
            .retry
            .call(&host.backend, "deny_access", || {
                driver.deny_access(&view, &rule, server.as_ref())
            })
            .await;

        match result {
            Ok(()) => {
                self.ctx.store.access_rules.remove(rule_id);
                self.ctx.events.publish(ShareEvent::AccessRuleChanged {
                    share_id: rule.share_id.clone(),
                    rule_id: rule_id.to_string(),
                    active: false,
                });
                Ok(())
            }
            Err(e) => {
                self.settle_rule(&rule.share_id, rule_id, AccessState::Error, None)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{new_id, AccessLevel, AccessRule, AccessType};
    use crate::drivers::Fault;
    use crate::share::testing::{backend, harness, placed_share, Harness};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    async fn available_share(h: &Harness, manager: &ShareManager, size: u64) -> Share {
        let share = placed_share("p1", size);
        h.ctx.store.shares.insert(share.clone()).unwrap();
        manager.create_share(&share.id, true).await.unwrap()
    }

    fn new_rule(share_id: &str, to: &str) -> AccessRule {
        AccessRule {
            id: new_id(),
            share_id: share_id.to_string(),
            access_type: AccessType::Ip,
            access_to: to.to_string(),
            access_level: AccessLevel::Rw,
            state: AccessState::New,
            access_key: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 5).await;

        assert_eq!(share.status, ShareStatus::Available);
        assert_eq!(share.export_locations.len(), 1);

        manager.delete_share(&share.id).await.unwrap();
        assert!(!h.ctx.store.shares.contains(&share.id));
        assert_eq!(h.driver.inventory().share_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        h.driver.inject_fault("create_share", Fault::Transient, 2);

        let share = available_share(&h, &manager, 1).await;
        assert_eq!(share.status, ShareStatus::Available);
        assert_eq!(h.driver.call_count("create_share"), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_to_error() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        h.driver.inject_fault("create_share", Fault::Transient, 3);

        let share = placed_share("p1", 1);
        h.ctx.store.shares.insert(share.clone()).unwrap();
        assert!(manager.create_share(&share.id, true).await.is_err());

        let stored = h.ctx.store.shares.require(&share.id).unwrap();
        assert_eq!(stored.status, ShareStatus::Error);
        assert!(stored.status_reason.is_some());
    }

    #[tokio::test]
    async fn test_non_final_failure_stays_creating() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        h.driver.inject_fault("create_share", Fault::Fatal, 1);

        let share = placed_share("p1", 1);
        h.ctx.store.shares.insert(share.clone()).unwrap();
        assert!(manager.create_share(&share.id, false).await.is_err());
        assert_eq!(
            h.ctx.store.shares.require(&share.id).unwrap().status,
            ShareStatus::Creating
        );
    }

    #[tokio::test]
    async fn test_delete_refused_with_snapshots() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 1).await;

        let snapshot = Snapshot {
            id: new_id(),
            share_id: share.id.clone(),
            name: "snap".into(),
            size_gb: 1,
            status: SnapshotStatus::Creating,
            status_reason: None,
            provider_location: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.ctx.store.snapshots.insert(snapshot.clone()).unwrap();
        let snapshot = manager.create_snapshot(&snapshot.id).await.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Available);

        assert_matches!(
            manager.delete_share(&share.id).await,
            Err(Error::InvalidState { .. })
        );
        manager.delete_snapshot(&snapshot.id).await.unwrap();
        manager.delete_share(&share.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_reserves_capacity() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 10).await;

        assert_matches!(
            manager.extend_share(&share.id, 500).await,
            Err(Error::InsufficientCapacity { .. })
        );
        assert_eq!(
            h.ctx.store.shares.require(&share.id).unwrap().status,
            ShareStatus::Available
        );

        let share = manager.extend_share(&share.id, 20).await.unwrap();
        assert_eq!(share.size_gb, 20);
        assert_eq!(h.ctx.hosts.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_extend_failure() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 10).await;
        h.driver.inject_fault("extend_share", Fault::Fatal, 1);

        assert!(manager.extend_share(&share.id, 20).await.is_err());
        let stored = h.ctx.store.shares.require(&share.id).unwrap();
        assert_eq!(stored.status, ShareStatus::ExtendingError);
        assert_eq!(stored.size_gb, 10);
        assert_eq!(h.ctx.hosts.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_shrink_possible_data_loss() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 10).await;
        h.driver.set_share_usage(&share.id, 6).unwrap();

        assert_matches!(
            manager.shrink_share(&share.id, 5).await,
            Err(Error::ShrinkPossibleDataLoss { .. })
        );
        let stored = h.ctx.store.shares.require(&share.id).unwrap();
        assert_eq!(stored.status, ShareStatus::ShrinkingPossibleDataLossError);
        assert_eq!(stored.size_gb, 10);
    }

    #[tokio::test]
    async fn test_shrink() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 10).await;
        let share = manager.shrink_share(&share.id, 4).await.unwrap();
        assert_eq!(share.size_gb, 4);
        assert_matches!(
            manager.shrink_share(&share.id, 0).await,
            Err(Error::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn test_access_rules_are_serialized_per_share() {
        let h = harness(backend(None)).await;
        let manager = Arc::new(ShareManager::new(h.ctx.clone()));
        let share = available_share(&h, &manager, 1).await;
        h.driver.set_delay(Duration::from_millis(10));

        let mut tasks = Vec::new();
        for n in 1..=4 {
            let rule = new_rule(&share.id, &format!("10.0.0.{}", n));
            h.ctx.store.access_rules.insert(rule.clone()).unwrap();
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.allow_access(&rule.id).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.driver.max_concurrency(&share.id), 1);
        assert!(h
            .ctx
            .store
            .access_rules_of(&share.id)
            .iter()
            .all(|r| r.state == AccessState::Active));
    }

    #[tokio::test]
    async fn test_failed_rule_goes_to_error_and_can_be_denied() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let share = available_share(&h, &manager, 1).await;
        h.driver.inject_fault("allow_access", Fault::Fatal, 1);

        let rule = new_rule(&share.id, "10.0.0.1");
        h.ctx.store.access_rules.insert(rule.clone()).unwrap();
        assert!(manager.allow_access(&rule.id).await.is_err());
        assert_eq!(
            h.ctx.store.access_rules.require(&rule.id).unwrap().state,
            AccessState::Error
        );
        manager.deny_access(&rule.id).await.unwrap();
        assert!(h.ctx.store.access_rules.is_empty());
    }

    #[tokio::test]
    async fn test_manage_unmanage_keeps_backend_data() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let fingerprint = h.driver.seed_existing_share("p1", "legacy:/export/data", 7);

        let mut share = placed_share("p1", 0);
        share.status = ShareStatus::Managing;
        h.ctx.store.shares.insert(share.clone()).unwrap();
        let managed = manager
            .manage_share(&share.id, "legacy:/export/data", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(managed.size_gb, 7);
        assert_eq!(managed.status, ShareStatus::Available);

        manager.unmanage_share(&share.id).await.unwrap();
        assert!(!h.ctx.store.shares.contains(&share.id));
        let left = h.driver.inventory().share_at("legacy:/export/data").unwrap();
        assert_eq!(left.fingerprint, fingerprint);
        assert!(left.owner.is_none());
    }

    #[tokio::test]
    async fn test_manage_failure_sets_error_managing() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let mut share = placed_share("p1", 0);
        share.status = ShareStatus::Managing;
        h.ctx.store.shares.insert(share.clone()).unwrap();

        assert!(manager
            .manage_share(&share.id, "missing:/export", &BTreeMap::new())
            .await
            .is_err());
        let stored = h.ctx.store.shares.require(&share.id).unwrap();
        assert_eq!(stored.status, ShareStatus::ErrorManaging);
        assert_eq!(stored.size_gb, 1);
    }

    #[tokio::test]
    async fn test_create_from_snapshot_keeps_data() {
        let h = harness(backend(None)).await;
        let manager = ShareManager::new(h.ctx.clone());
        let source = available_share(&h, &manager, 2).await;
        let snapshot = Snapshot {
            id: new_id(),
            share_id: source.id.clone(),
            name: "snap".into(),
            size_gb: 2,
            status: SnapshotStatus::Creating,
            status_reason: None,
            provider_location: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.ctx.store.snapshots.insert(snapshot.clone()).unwrap();
        manager.create_snapshot(&snapshot.id).await.unwrap();

        let mut clone = placed_share("p1", 2);
        clone.snapshot_id = Some(snapshot.id.clone());
        h.ctx.store.shares.insert(clone.clone()).unwrap();
        manager.create_share(&clone.id, true).await.unwrap();

        let original = h.driver.inventory().share(&source.id).unwrap();
        let copy = h.driver.inventory().share(&clone.id).unwrap();
        assert_eq!(original.fingerprint, copy.fingerprint);
    }
}
