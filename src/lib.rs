//! Shareplane - Shared File System Control Plane
//!
//! Provisions shared file systems (NFS, CIFS, CephFS, ...) across multiple
//! storage backends: a filter scheduler picks a pool, the share manager
//! drives the share through its lifecycle on the backend's driver.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Orchestrator                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Filter Scheduler│  │  Share Manager  │  │  Replication / Consistency  │  │
//! │  │ filters/weighers│  │  state machine  │  │  Group Coordinators         │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │  ┌────────┴────────┐  ┌────────┴───────────────────┐     │                  │
//! │  │  Host Manager   │  │  Share Server Manager      │     │                  │
//! │  │ (pool cache,    │  │  (refcounted per network)  │     │                  │
//! │  │  reservations)  │  └────────┬───────────────────┘     │                  │
//! │  └─────────────────┘           └─────────────┬───────────┘                  │
//! ├──────────────────────────────────────────────┼──────────────────────────────┤
//! │                          Driver Registry     │                              │
//! │  ┌────────────┐  ┌────────────┐  ┌───────────┴┐  ┌────────────┐             │
//! │  │   CephFS   │  │  Generic   │  │    ZFS     │  │    Fake    │             │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────┘             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                 State Store (sharded tables, status CAS)                    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, the public entry point
//! - [`scheduler`]: Pool cache, filters, weighers and reservations
//! - [`share`]: Share manager, share servers, replication, consistency groups
//! - [`drivers`]: Backend drivers and their registry
//! - [`domain`]: Core records and the driver trait
//! - [`store`]: In-process state store
//! - [`config`]: YAML configuration
//! - [`events`]: Lifecycle event broadcast
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod share;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    CreateConsistencyGroupRequest, CreateShareRequest, ManageShareRequest, Orchestrator,
    OrchestratorStatus, PoolQuery, SchedulerHints,
};

pub use config::{BackendConfig, Config, DriverKind, PoolConfig};

pub use domain::{
    AccessLevel, AccessRule, AccessType, CgSnapshot, ConsistencyGroup, DriverCapabilities,
    ExportLocation, PoolRef, Replica, ReplicaState, Share, ShareDriver, ShareProtocol,
    ShareStatus, ShareType, Snapshot,
};

pub use drivers::{DriverFactory, DriverRegistry, FakeDriver, Fault};

pub use error::{Error, ErrorAction, Result};

pub use events::{EventBus, ShareEvent};

pub use metrics::ControlPlaneMetrics;

pub use scheduler::{FilterScheduler, HostManager, PoolState, SchedulingRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
