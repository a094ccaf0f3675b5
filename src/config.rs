//! Configuration
//!
//! YAML configuration for the control plane: scheduler and manager tuning,
//! capability refresh, replication polling and the named backend groups.
//! Every section has defaults so a file only needs to list backends.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Scheduler
// =============================================================================

/// Scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Placement attempts per request, including the first
    pub max_attempts: u32,
    /// Enabled filters, by name
    pub filters: Vec<String>,
    /// Enabled weighers, by name
    pub weighers: Vec<String>,
    /// Negative values stack shares onto the fullest pool
    pub capacity_weight_multiplier: f64,
    pub allocated_capacity_weight_multiplier: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            filters: [
                "AvailabilityZoneFilter",
                "CapacityFilter",
                "CapabilitiesFilter",
                "ProtocolFilter",
                "ConsistencyGroupFilter",
                "ShareReplicationFilter",
                "AffinityFilter",
                "AntiAffinityFilter",
                "RetryFilter",
                "SameHostFilter",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            weighers: vec!["CapacityWeigher".to_string()],
            capacity_weight_multiplier: 1.0,
            allocated_capacity_weight_multiplier: -1.0,
        }
    }
}

// =============================================================================
// Share Manager
// =============================================================================

/// Share manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Attempts for a driver call that fails transiently
    pub driver_retry_attempts: u32,
    pub driver_retry_initial_interval_ms: u64,
    pub driver_retry_max_interval_ms: u64,
    /// Tear a share server down as soon as its last share is deleted
    pub delete_share_server_with_last_share: bool,
    /// Periodically tear down share servers nobody uses
    pub automatic_share_server_cleanup: bool,
    /// Minutes a server must sit unused before cleanup (10-60)
    pub unused_share_server_cleanup_interval_mins: u64,
    /// Deny every access rule before unmanaging a share
    pub unmanage_remove_access_rules: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            driver_retry_attempts: 3,
            driver_retry_initial_interval_ms: 200,
            driver_retry_max_interval_ms: 5_000,
            delete_share_server_with_last_share: true,
            automatic_share_server_cleanup: true,
            unused_share_server_cleanup_interval_mins: 10,
            unmanage_remove_access_rules: false,
        }
    }
}

impl ManagerConfig {
    pub fn unused_server_age(&self) -> Duration {
        Duration::from_secs(self.unused_share_server_cleanup_interval_mins * 60)
    }
}

// =============================================================================
// Capabilities & Replication
// =============================================================================

/// Capability cache refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    pub refresh_interval_secs: u64,
    /// Pools not refreshed within this window are not scheduled to
    pub stale_after_secs: u64,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            stale_after_secs: 180,
        }
    }
}

/// Replica state polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub replica_state_update_interval_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_state_update_interval_secs: 300,
        }
    }
}

// =============================================================================
// Backends
// =============================================================================

/// Driver implementation behind a backend group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Cephfs,
    Generic,
    Zfs,
    Fake,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Cephfs => write!(f, "cephfs"),
            DriverKind::Generic => write!(f, "generic"),
            DriverKind::Zfs => write!(f, "zfs"),
            DriverKind::Fake => write!(f, "fake"),
        }
    }
}

/// A pool exposed by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub total_capacity_gb: u64,
}

/// One named backend group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub driver: DriverKind,
    pub driver_handles_share_servers: bool,
    /// Name reported to the scheduler; defaults to the group name
    pub share_backend_name: Option<String>,
    /// Overrides the global storage availability zone
    pub availability_zone: Option<String>,
    pub reserved_percentage: u8,
    pub thin_provisioning: bool,
    pub max_over_subscription_ratio: f64,
    /// Backends sharing a domain can replicate to each other
    pub replication_domain: Option<String>,
    pub pools: Vec<PoolConfig>,
    /// Driver specific settings
    pub options: BTreeMap<String, String>,
    /// Extra capabilities reported for every pool
    pub capabilities: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Fake,
            driver_handles_share_servers: false,
            share_backend_name: None,
            availability_zone: None,
            reserved_percentage: 0,
            thin_provisioning: false,
            max_over_subscription_ratio: 20.0,
            replication_domain: None,
            pools: Vec::new(),
            options: BTreeMap::new(),
            capabilities: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    /// Driver option or a default
    pub fn option_or(&self, key: &str, default: &str) -> String {
        self.options
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

// =============================================================================
// Root
// =============================================================================

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_availability_zone: String,
    /// Share type used when a request names none
    pub default_share_type: Option<String>,
    /// Backends to start; empty starts all
    pub enabled_backends: Vec<String>,
    pub scheduler: SchedulerConfig,
    pub manager: ManagerConfig,
    pub capabilities: CapabilitiesConfig,
    pub replication: ReplicationConfig,
    pub backends: BTreeMap<String, BackendConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_availability_zone: "nova".to_string(),
            default_share_type: None,
            enabled_backends: Vec::new(),
            scheduler: SchedulerConfig::default(),
            manager: ManagerConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            replication: ReplicationConfig::default(),
            backends: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_attempts == 0 {
            return Err(Error::Configuration(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }

        let interval = self.manager.unused_share_server_cleanup_interval_mins;
        if !(10..=60).contains(&interval) {
            return Err(Error::Configuration(format!(
                "manager.unused_share_server_cleanup_interval_mins must be 10-60, got {}",
                interval
            )));
        }

        if self.manager.driver_retry_attempts == 0 {
            return Err(Error::Configuration(
                "manager.driver_retry_attempts must be at least 1".into(),
            ));
        }

        for name in &self.enabled_backends {
            if !self.backends.contains_key(name) {
                return Err(Error::Configuration(format!(
                    "enabled backend '{}' is not configured",
                    name
                )));
            }
        }

        for (name, backend) in &self.backends {
            if name.is_empty() || name.contains('#') {
                return Err(Error::Configuration(format!(
                    "invalid backend name '{}'",
                    name
                )));
            }
            if backend.reserved_percentage > 100 {
                return Err(Error::Configuration(format!(
                    "backend {}: reserved_percentage must be 0-100",
                    name
                )));
            }
            if backend.max_over_subscription_ratio < 1.0 {
                return Err(Error::Configuration(format!(
                    "backend {}: max_over_subscription_ratio must be >= 1.0",
                    name
                )));
            }
            if backend.pools.is_empty() {
                return Err(Error::Configuration(format!(
                    "backend {}: at least one pool is required",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Backends to start, by name
    pub fn active_backends(&self) -> Vec<(&String, &BackendConfig)> {
        self.backends
            .iter()
            .filter(|(name, _)| {
                self.enabled_backends.is_empty() || self.enabled_backends.contains(name)
            })
            .collect()
    }

    /// Availability zone a backend reports
    pub fn zone_of(&self, backend: &BackendConfig) -> String {
        backend
            .availability_zone
            .clone()
            .unwrap_or_else(|| self.storage_availability_zone.clone())
    }
}
