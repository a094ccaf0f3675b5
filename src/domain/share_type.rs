//! Share Types
//!
//! Named bundles of extra specs. Every type must say whether the backend
//! handles share servers; a few other well-known specs are validated and
//! normalized on creation.

use crate::domain::model::{new_id, ReplicationType};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Required spec: does the backend manage share servers
pub const DHSS_SPEC: &str = "driver_handles_share_servers";
/// Optional boolean spec, defaults to true
pub const SNAPSHOT_SUPPORT_SPEC: &str = "snapshot_support";
/// Optional replication flavour
pub const REPLICATION_TYPE_SPEC: &str = "replication_type";
/// Optional boolean spec requiring consistency group support
pub const CG_SUPPORT_SPEC: &str = "consistency_group_support";

const BOOLEAN_SPECS: &[&str] = &[DHSS_SPEC, SNAPSHOT_SUPPORT_SPEC, CG_SUPPORT_SPEC];

const MAX_SPEC_LEN: usize = 255;

/// Parse a boolean extra spec value, accepting an optional `<is>` prefix
pub fn parse_bool_spec(value: &str) -> Option<bool> {
    let value = value.trim();
    let value = value.strip_prefix("<is>").unwrap_or(value).trim();
    match value.to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Render a boolean the way backends report capabilities
pub fn bool_spec(value: bool) -> String {
    if value { "True" } else { "False" }.to_string()
}

/// A named share type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareType {
    pub id: String,
    pub name: String,
    pub extra_specs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ShareType {
    /// Create a share type after validating its extra specs
    pub fn new(name: impl Into<String>, extra_specs: BTreeMap<String, String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidShareType("share type name is empty".into()));
        }

        Ok(Self {
            id: new_id(),
            name,
            extra_specs: normalize_extra_specs(extra_specs, true)?,
            created_at: Utc::now(),
        })
    }

    /// Whether shares of this type need a share server
    pub fn dhss(&self) -> bool {
        spec_dhss(&self.extra_specs)
    }

    pub fn snapshot_support(&self) -> bool {
        spec_snapshot_support(&self.extra_specs)
    }

    pub fn replication_type(&self) -> Option<ReplicationType> {
        spec_replication_type(&self.extra_specs)
    }
}

/// Validate specs and canonicalize boolean values to `True`/`False`
pub fn normalize_extra_specs(
    extra_specs: BTreeMap<String, String>,
    require_dhss: bool,
) -> Result<BTreeMap<String, String>> {
    if require_dhss && !extra_specs.contains_key(DHSS_SPEC) {
        return Err(Error::InvalidExtraSpec {
            key: DHSS_SPEC.into(),
            reason: "required extra spec is missing".into(),
        });
    }

    let mut normalized = BTreeMap::new();
    for (key, value) in extra_specs {
        if key.is_empty() || key.len() > MAX_SPEC_LEN || value.len() > MAX_SPEC_LEN {
            return Err(Error::InvalidExtraSpec {
                key,
                reason: format!("keys and values must be 1-{} characters", MAX_SPEC_LEN),
            });
        }

        let value = if BOOLEAN_SPECS.contains(&key.as_str()) {
            match parse_bool_spec(&value) {
                Some(b) => bool_spec(b),
                None => {
                    return Err(Error::InvalidExtraSpec {
                        key,
                        reason: format!("'{}' is not a boolean", value),
                    })
                }
            }
        } else if key == REPLICATION_TYPE_SPEC {
            value.parse::<ReplicationType>()?.to_string()
        } else {
            value
        };

        normalized.insert(key, value);
    }

    Ok(normalized)
}

/// DHSS flag from a spec map; absent means false
pub fn spec_dhss(specs: &BTreeMap<String, String>) -> bool {
    specs
        .get(DHSS_SPEC)
        .and_then(|v| parse_bool_spec(v))
        .unwrap_or(false)
}

/// Snapshot support from a spec map; absent means true
pub fn spec_snapshot_support(specs: &BTreeMap<String, String>) -> bool {
    specs
        .get(SNAPSHOT_SUPPORT_SPEC)
        .and_then(|v| parse_bool_spec(v))
        .unwrap_or(true)
}

pub fn spec_replication_type(specs: &BTreeMap<String, String>) -> Option<ReplicationType> {
    specs
        .get(REPLICATION_TYPE_SPEC)
        .and_then(|v| v.parse::<ReplicationType>().ok())
}
