//! Error types for the share control plane
//!
//! Provides structured error types for the scheduler, driver layer, share
//! manager, replication and consistency group coordinators.

use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Invalid state for {kind}/{id}: {reason}")]
    InvalidState {
        kind: String,
        id: String,
        reason: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid share type: {0}")]
    InvalidShareType(String),

    #[error("Invalid extra spec {key}: {reason}")]
    InvalidExtraSpec { key: String, reason: String },

    // =========================================================================
    // Scheduler Errors
    // =========================================================================
    #[error("No valid host was found: {reason}")]
    NoValidHost { reason: String },

    #[error("Insufficient capacity: requested {requested} GiB, available {available} GiB")]
    InsufficientCapacity { requested: u64, available: u64 },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Backend {backend} does not support {capability}")]
    DriverCapability { backend: String, capability: String },

    #[error("Driver operation failed: {backend} - {operation}: {reason}")]
    DriverOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Driver operation failed permanently: {backend} - {operation}: {reason}")]
    DriverOperationFatal {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Shrinking share {share_id} would lose data: {used_gb} GiB in use, requested {new_size} GiB")]
    ShrinkPossibleDataLoss {
        share_id: String,
        used_gb: u64,
        new_size: u64,
    },

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Invalid share access: {0}")]
    InvalidShareAccess(String),

    #[error("Access rule already exists for {access_type}:{access_to}")]
    AccessRuleExists {
        access_type: String,
        access_to: String,
    },

    // =========================================================================
    // Share Server Errors
    // =========================================================================
    #[error("Share server {server_id} is in use by {share_count} share(s)")]
    ShareServerInUse { server_id: String, share_count: usize },

    // =========================================================================
    // Replication Errors
    // =========================================================================
    #[error("Cannot promote replica {replica_id}: {reason}")]
    ReplicationPromotion { replica_id: String, reason: String },

    #[error("Replication error: {0}")]
    Replication(String),

    // =========================================================================
    // Consistency Group Errors
    // =========================================================================
    #[error("Consistency group snapshot {cgsnapshot_id} failed: {reason}")]
    ConsistencyGroupPartialFailure {
        cgsnapshot_id: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the driver call with exponential backoff
    RetryWithBackoff,
    /// Stop and move the entity into its error status
    Escalate,
    /// Return to the caller without touching entity state
    Surface,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::DriverOperationFailed { .. } | Error::BackendUnavailable { .. } => {
                ErrorAction::RetryWithBackoff
            }

            // Terminal driver outcomes
            Error::DriverOperationFatal { .. }
            | Error::ShrinkPossibleDataLoss { .. }
            | Error::ConsistencyGroupPartialFailure { .. }
            | Error::Replication(_)
            | Error::Internal(_) => ErrorAction::Escalate,

            // Validation and lookup errors are the caller's problem
            _ => ErrorAction::Surface,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.action() == ErrorAction::RetryWithBackoff
    }

    /// Shorthand for a missing resource
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Shorthand for an entity in the wrong status
    pub fn invalid_state(kind: &str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            kind: kind.to_string(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::DriverOperationFailed {
            backend: "cephfs1".into(),
            operation: "create_share".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

        let err = Error::DriverOperationFatal {
            backend: "cephfs1".into(),
            operation: "create_share".into(),
            reason: "quota".into(),
        };
        assert_eq!(err.action(), ErrorAction::Escalate);

        let err = Error::NoValidHost {
            reason: "no pools".into(),
        };
        assert_eq!(err.action(), ErrorAction::Surface);
    }

    #[test]
    fn test_error_transient() {
        let transient = Error::BackendUnavailable {
            backend: "zfs1".into(),
        };
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::not_found("Share", "abc");
        assert_eq!(err.to_string(), "Resource not found: Share/abc");

        let err = Error::ReplicationPromotion {
            replica_id: "r1".into(),
            reason: "replica is out_of_sync".into(),
        };
        assert!(err.to_string().contains("out_of_sync"));
    }
}
