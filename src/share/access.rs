//! Access rule validation
//!
//! Which access types each protocol accepts, and the shape of the client
//! identifier for each type.

use crate::domain::model::{AccessRule, AccessType, ShareProtocol};
use crate::error::{Error, Result};
use std::net::IpAddr;

/// Access types a protocol accepts
pub fn allowed_types(protocol: ShareProtocol) -> &'static [AccessType] {
    match protocol {
        ShareProtocol::Nfs => &[AccessType::Ip],
        ShareProtocol::Cifs => &[AccessType::Ip, AccessType::User],
        ShareProtocol::Glusterfs => &[AccessType::Cert],
        ShareProtocol::Hdfs => &[AccessType::User],
        ShareProtocol::Cephfs => &[AccessType::Cephx],
    }
}

/// Check a new rule against the share protocol and existing rules
pub fn validate(
    protocol: ShareProtocol,
    access_type: AccessType,
    access_to: &str,
    existing: &[AccessRule],
) -> Result<()> {
    if !allowed_types(protocol).contains(&access_type) {
        return Err(Error::InvalidShareAccess(format!(
            "{} access is not supported for {} shares",
            access_type, protocol
        )));
    }

    match access_type {
        AccessType::Ip => validate_ip(access_to)?,
        AccessType::User => validate_name(access_to, 4, 255, "user")?,
        AccessType::Cert => validate_name(access_to, 1, 64, "certificate common name")?,
        AccessType::Cephx => {
            validate_name(access_to, 1, 64, "cephx id")?;
            if access_to.contains(',') {
                return Err(Error::InvalidShareAccess(
                    "cephx id must not contain commas".into(),
                ));
            }
        }
    }

    if existing
        .iter()
        .any(|r| r.access_type == access_type && r.access_to == access_to)
    {
        return Err(Error::AccessRuleExists {
            access_type: access_type.to_string(),
            access_to: access_to.to_string(),
        });
    }
    Ok(())
}

/// Address or CIDR block
fn validate_ip(access_to: &str) -> Result<()> {
    let invalid = || Error::InvalidShareAccess(format!("invalid ip or cidr '{}'", access_to));
    let (addr, prefix) = match access_to.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (access_to, None),
    };
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(invalid());
        }
    }
    Ok(())
}

fn validate_name(access_to: &str, min: usize, max: usize, what: &str) -> Result<()> {
    let len = access_to.chars().count();
    if len < min || len > max || access_to.chars().any(char::is_whitespace) {
        return Err(Error::InvalidShareAccess(format!(
            "{} '{}' must be {}-{} characters without whitespace",
            what, access_to, min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{AccessLevel, AccessState};
    use assert_matches::assert_matches;
    use chrono::Utc;

    #[test]
    fn test_protocol_access_types() {
        assert!(validate(ShareProtocol::Nfs, AccessType::Ip, "10.0.0.0/24", &[]).is_ok());
        assert!(validate(ShareProtocol::Nfs, AccessType::User, "alice", &[]).is_err());
        assert!(validate(ShareProtocol::Cifs, AccessType::User, "alice", &[]).is_ok());
        assert!(
            validate(ShareProtocol::Glusterfs, AccessType::Cert, "client.example", &[]).is_ok()
        );
        assert!(validate(ShareProtocol::Hdfs, AccessType::User, "hadoop", &[]).is_ok());
        assert!(validate(ShareProtocol::Cephfs, AccessType::Cephx, "alice", &[]).is_ok());
        assert!(validate(ShareProtocol::Cephfs, AccessType::Ip, "10.0.0.1", &[]).is_err());
    }

    #[test]
    fn test_ip_format() {
        assert!(validate_ip("10.0.0.1").is_ok());
        assert!(validate_ip("fd00::/64").is_ok());
        assert!(validate_ip("10.0.0.0/33").is_err());
        assert!(validate_ip("10.0.0").is_err());
    }

    #[test]
    fn test_cephx_rejects_commas() {
        assert!(validate(ShareProtocol::Cephfs, AccessType::Cephx, "a,b", &[]).is_err());
    }

    #[test]
    fn test_duplicate_rule() {
        let rule = AccessRule {
            id: "r1".into(),
            share_id: "s1".into(),
            access_type: AccessType::Ip,
            access_to: "10.0.0.1".into(),
            access_level: AccessLevel::Rw,
            state: AccessState::Active,
            access_key: None,
            created_at: Utc::now(),
        };
        assert_matches!(
            validate(ShareProtocol::Nfs, AccessType::Ip, "10.0.0.1", &[rule]),
            Err(Error::AccessRuleExists { .. })
        );
    }
}
