//! Scheduler
//!
//! Pool selection for shares, replicas and consistency groups:
//! - Host manager: capability cache and capacity reservations
//! - Filters: hard placement constraints
//! - Weighers: ranking of the remaining pools
//! - Extra spec operators: share type requirement matching

pub mod extra_specs_ops;
pub mod filter_scheduler;
pub mod filters;
pub mod host_manager;
pub mod weighers;

pub use filter_scheduler::{FilterScheduler, ReplicaPlacement, SchedulingRequest};
pub use host_manager::{HostManager, PoolState, Reservation};
pub use weighers::WeighedPool;
