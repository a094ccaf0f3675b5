//! Control Plane Module
//!
//! The "brain" of the share service: the orchestrator that callers drive
//! and that ties the scheduler, the share manager and the coordinators
//! together.

pub mod orchestrator;

pub use orchestrator::*;
