//! Pool Filters
//!
//! Each filter decides whether one pool may host a request. A pool is a
//! candidate only if every enabled filter passes it.

use super::extra_specs_ops;
use super::filter_scheduler::SchedulingRequest;
use super::host_manager::PoolState;
use crate::error::{Error, Result};
use tracing::trace;

/// A placement constraint
pub trait PoolFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool;
}

/// Build a filter from its configured name
pub fn filter_by_name(name: &str) -> Result<Box<dyn PoolFilter>> {
    let filter: Box<dyn PoolFilter> = match name {
        "AvailabilityZoneFilter" => Box::new(AvailabilityZoneFilter),
        "CapacityFilter" => Box::new(CapacityFilter),
        "CapabilitiesFilter" => Box::new(CapabilitiesFilter),
        "ProtocolFilter" => Box::new(ProtocolFilter),
        "ConsistencyGroupFilter" => Box::new(ConsistencyGroupFilter),
        "ShareReplicationFilter" => Box::new(ShareReplicationFilter),
        "AffinityFilter" => Box::new(AffinityFilter),
        "AntiAffinityFilter" => Box::new(AntiAffinityFilter),
        "RetryFilter" => Box::new(RetryFilter),
        "SameHostFilter" => Box::new(SameHostFilter),
        other => {
            return Err(Error::Configuration(format!(
                "unknown scheduler filter '{}'",
                other
            )))
        }
    };
    Ok(filter)
}

/// Requested zone must match the pool's zone
pub struct AvailabilityZoneFilter;

impl PoolFilter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "AvailabilityZoneFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        request
            .availability_zone
            .as_ref()
            .map_or(true, |zone| *zone == pool.availability_zone)
    }
}

/// Pool must have room for the share
pub struct CapacityFilter;

impl PoolFilter for CapacityFilter {
    fn name(&self) -> &'static str {
        "CapacityFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        pool.fits(request.size_gb)
    }
}

/// Unscoped and `capabilities:` extra specs must match pool capabilities
///
/// Specs under any other scope belong to a driver and are skipped.
pub struct CapabilitiesFilter;

impl CapabilitiesFilter {
    fn capability_key(key: &str) -> Option<&str> {
        match key.split_once(':') {
            None => Some(key),
            Some(("capabilities", rest)) => Some(rest),
            Some(_) => None,
        }
    }
}

impl PoolFilter for CapabilitiesFilter {
    fn name(&self) -> &'static str {
        "CapabilitiesFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        request.extra_specs.iter().all(|(key, requirement)| {
            let Some(capability) = Self::capability_key(key) else {
                return true;
            };
            let value = pool.capability(capability);
            let ok = extra_specs_ops::matches(value.as_deref(), requirement);
            if !ok {
                trace!(
                    "{} fails {}={} (has {:?})",
                    pool.host,
                    key,
                    requirement,
                    value
                );
            }
            ok
        })
    }
}

/// Pool's backend must speak the requested protocol
pub struct ProtocolFilter;

impl PoolFilter for ProtocolFilter {
    fn name(&self) -> &'static str {
        "ProtocolFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        request
            .protocol
            .map_or(true, |protocol| pool.storage_protocols.contains(&protocol))
    }
}

/// Consistency group members land on the group's pool
pub struct ConsistencyGroupFilter;

impl PoolFilter for ConsistencyGroupFilter {
    fn name(&self) -> &'static str {
        "ConsistencyGroupFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        if request.require_cg_support && !pool.consistency_group_support {
            return false;
        }
        request
            .consistency_group_host
            .as_ref()
            .map_or(true, |host| *host == pool.host)
    }
}

/// Replica targets stay in the replication domain, one replica per pool
pub struct ShareReplicationFilter;

impl PoolFilter for ShareReplicationFilter {
    fn name(&self) -> &'static str {
        "ShareReplicationFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        let Some(replication) = &request.replication else {
            return true;
        };
        let same_domain = match (&replication.domain, &pool.replication_domain) {
            (Some(wanted), Some(domain)) => wanted == domain,
            _ => false,
        };
        same_domain && !replication.existing_hosts.contains(&pool.host)
    }
}

/// `same_host` hint: stay on the backends of the named shares
pub struct AffinityFilter;

impl PoolFilter for AffinityFilter {
    fn name(&self) -> &'static str {
        "AffinityFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        request
            .same_host
            .iter()
            .all(|host| host.backend == pool.host.backend)
    }
}

/// `different_host` hint: avoid the backends of the named shares
pub struct AntiAffinityFilter;

impl PoolFilter for AntiAffinityFilter {
    fn name(&self) -> &'static str {
        "AntiAffinityFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        !request
            .different_host
            .iter()
            .any(|host| host.backend == pool.host.backend)
    }
}

/// Skip pools already tried for this request
pub struct RetryFilter;

impl PoolFilter for RetryFilter {
    fn name(&self) -> &'static str {
        "RetryFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        !request.tried_hosts.contains(&pool.host)
    }
}

/// Shares created from a snapshot stay on the snapshot's pool
pub struct SameHostFilter;

impl PoolFilter for SameHostFilter {
    fn name(&self) -> &'static str {
        "SameHostFilter"
    }

    fn passes(&self, pool: &PoolState, request: &SchedulingRequest) -> bool {
        request
            .snapshot_host
            .as_ref()
            .map_or(true, |host| *host == pool.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{PoolRef, ShareProtocol};
    use crate::scheduler::filter_scheduler::ReplicaPlacement;
    use crate::scheduler::host_manager::tests::{backend_stats, pool_stats};
    use crate::scheduler::host_manager::HostManager;
    use std::time::Duration;

    fn pool(backend: &str, name: &str) -> PoolState {
        let hosts = HostManager::new(Duration::from_secs(60));
        let mut stats = backend_stats(backend, vec![pool_stats(name, 100, 50)]);
        stats.replication_domain = Some("east".into());
        hosts.update_from_stats(&stats);
        hosts.get(&PoolRef::new(backend, name)).unwrap()
    }

    fn request() -> SchedulingRequest {
        SchedulingRequest::new(10)
    }

    #[test]
    fn test_unknown_filter_name() {
        assert!(filter_by_name("CapacityFilter").is_ok());
        assert!(filter_by_name("RamFilter").is_err());
    }

    #[test]
    fn test_availability_zone() {
        let mut req = request();
        assert!(AvailabilityZoneFilter.passes(&pool("b1", "p1"), &req));
        req.availability_zone = Some("other".into());
        assert!(!AvailabilityZoneFilter.passes(&pool("b1", "p1"), &req));
    }

    #[test]
    fn test_capabilities_scopes() {
        let p = pool("b1", "p1");
        let mut req = request();
        req.extra_specs
            .insert("driver_handles_share_servers".into(), "False".into());
        req.extra_specs
            .insert("cephfs:data_isolated".into(), "True".into());
        assert!(CapabilitiesFilter.passes(&p, &req));

        req.extra_specs
            .insert("capabilities:snapshot_support".into(), "<is> False".into());
        assert!(!CapabilitiesFilter.passes(&p, &req));
    }

    #[test]
    fn test_missing_capability_fails() {
        let mut req = request();
        req.extra_specs.insert("compression".into(), "True".into());
        assert!(!CapabilitiesFilter.passes(&pool("b1", "p1"), &req));
    }

    #[test]
    fn test_protocol() {
        let mut req = request();
        req.protocol = Some(ShareProtocol::Cephfs);
        assert!(!ProtocolFilter.passes(&pool("b1", "p1"), &req));
        req.protocol = Some(ShareProtocol::Cifs);
        assert!(ProtocolFilter.passes(&pool("b1", "p1"), &req));
    }

    #[test]
    fn test_replication_excludes_existing_hosts() {
        let mut req = request();
        req.replication = Some(ReplicaPlacement {
            domain: Some("east".into()),
            existing_hosts: vec![PoolRef::new("b1", "p1")],
        });
        assert!(!ShareReplicationFilter.passes(&pool("b1", "p1"), &req));
        assert!(ShareReplicationFilter.passes(&pool("b1", "p2"), &req));

        req.replication = Some(ReplicaPlacement {
            domain: Some("west".into()),
            existing_hosts: vec![],
        });
        assert!(!ShareReplicationFilter.passes(&pool("b1", "p2"), &req));
    }

    #[test]
    fn test_affinity_hints_compare_backends() {
        let mut req = request();
        req.same_host = vec![PoolRef::new("b1", "other")];
        assert!(AffinityFilter.passes(&pool("b1", "p1"), &req));
        assert!(!AffinityFilter.passes(&pool("b2", "p1"), &req));

        req.different_host = vec![PoolRef::new("b1", "other")];
        assert!(!AntiAffinityFilter.passes(&pool("b1", "p1"), &req));
        assert!(AntiAffinityFilter.passes(&pool("b2", "p1"), &req));
    }

    #[test]
    fn test_pinning_filters() {
        let mut req = request();
        req.tried_hosts = vec![PoolRef::new("b1", "p1")];
        assert!(!RetryFilter.passes(&pool("b1", "p1"), &req));

        req.snapshot_host = Some(PoolRef::new("b1", "p2"));
        assert!(SameHostFilter.passes(&pool("b1", "p2"), &req));
        assert!(!SameHostFilter.passes(&pool("b1", "p1"), &req));

        req.require_cg_support = true;
        assert!(!ConsistencyGroupFilter.passes(&pool("b1", "p1"), &req));
    }
}
