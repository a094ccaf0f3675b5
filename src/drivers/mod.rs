//! Share Drivers
//!
//! Implementations of [`ShareDriver`](crate::domain::ShareDriver):
//! - CephFS: native CephFS volumes, cephx access, consistency groups
//! - Generic: NFS/CIFS from service instances, optional share servers
//! - ZFS: NFS datasets with readable replication
//! - Fake: every optional operation plus fault injection

pub mod cephfs;
pub mod fake;
pub mod generic;
pub mod inventory;
pub mod zfs;

pub use cephfs::CephFsDriver;
pub use fake::{FakeDriver, Fault};
pub use generic::GenericDriver;
pub use zfs::ZfsDriver;

use crate::config::{BackendConfig, DriverKind};
use crate::domain::ports::DriverRef;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Factory for creating drivers from backend configuration
pub struct DriverFactory;

impl DriverFactory {
    /// Create the driver for a named backend group
    pub fn create(name: &str, config: &BackendConfig, zone: &str) -> Result<DriverRef> {
        let driver: DriverRef = match config.driver {
            DriverKind::Cephfs => Arc::new(CephFsDriver::new(name, config, zone)?),
            DriverKind::Generic => Arc::new(GenericDriver::new(name, config, zone)),
            DriverKind::Zfs => Arc::new(ZfsDriver::new(name, config, zone)?),
            DriverKind::Fake => Arc::new(FakeDriver::new(name, config, zone)),
        };
        Ok(driver)
    }
}

/// Drivers keyed by backend name
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<BTreeMap<String, DriverRef>>,
}

impl DriverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a driver under its backend name
    pub fn register(&self, driver: DriverRef) -> Result<()> {
        let name = driver.backend_name().to_string();
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "Backend".into(),
                name,
            });
        }
        info!("Registered backend: {}", name);
        drivers.insert(name, driver);
        Ok(())
    }

    /// Driver for a backend
    pub fn get(&self, backend: &str) -> Result<DriverRef> {
        self.drivers
            .read()
            .get(backend)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable {
                backend: backend.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<DriverRef> {
        self.drivers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
