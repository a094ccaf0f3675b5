//! Domain layer - Core records and port definitions
//!
//! This module defines the share records, share types and the driver trait
//! (port) that backend adapters implement.

pub mod model;
pub mod ports;
pub mod share_type;

pub use model::*;
pub use ports::*;
pub use share_type::ShareType;
