//! Typed rows for the four northbound-database tables this system programs.
//! The OVSDB wire encoding itself lives behind [`super::backend::NbBackend`];
//! these are the shapes carried across that boundary.

use std::collections::BTreeMap;

pub type ExternalIds = BTreeMap<String, String>;

pub const MANAGED_BY_KEY: &str = "zstack.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "zstack-ovn-kubernetes";
pub const TENANT_MANAGED_BY_VALUE: &str = "zstack";
pub const TENANT_VPC_UUID_KEY: &str = "zstack.io/vpc-uuid";
pub const TENANT_SUBNET_UUID_KEY: &str = "zstack.io/subnet-uuid";
pub const TENANT_NETWORK_UUID_KEY: &str = "zstack.io/network-uuid";

pub fn our_marker() -> ExternalIds {
    let mut ids = ExternalIds::new();
    ids.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
    ids
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalSwitch {
    pub uuid: String,
    pub name: String,
    pub other_config: BTreeMap<String, String>,
    pub external_ids: ExternalIds,
    pub ports: Vec<String>,
    pub acls: Vec<String>,
    pub load_balancer: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalSwitchPort {
    pub uuid: String,
    pub name: String,
    pub addresses: Vec<String>,
    pub port_security: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub external_ids: ExternalIds,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancer {
    pub uuid: String,
    pub name: String,
    /// `"<ip>:<port>" -> "<backend1>:<port>,<backend2>:<port>,…"`.
    pub vips: BTreeMap<String, String>,
    pub protocol: String,
    pub options: BTreeMap<String, String>,
    pub external_ids: ExternalIds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    FromLport,
    ToLport,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::FromLport => "from-lport",
            Direction::ToLport => "to-lport",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Allow,
    AllowRelated,
    Drop,
    Reject,
    Pass,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::AllowRelated => "allow-related",
            Action::Drop => "drop",
            Action::Reject => "reject",
            Action::Pass => "pass",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub uuid: String,
    pub direction: Direction,
    pub priority: i32,
    pub match_: String,
    pub action: Action,
    pub external_ids: ExternalIds,
    pub log: bool,
    pub severity: Option<String>,
}

/// What the compatibility layer found when it looked at a row's
/// `external_ids`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Ours,
    TenantManaged,
    Unmanaged,
}

pub fn classify(external_ids: &ExternalIds) -> Ownership {
    if external_ids.get(MANAGED_BY_KEY).map(String::as_str) == Some(MANAGED_BY_VALUE) {
        return Ownership::Ours;
    }
    let tenant_keys = [
        TENANT_VPC_UUID_KEY,
        TENANT_SUBNET_UUID_KEY,
        TENANT_NETWORK_UUID_KEY,
    ];
    let is_tenant = external_ids.get(MANAGED_BY_KEY).map(String::as_str) == Some(TENANT_MANAGED_BY_VALUE)
        || tenant_keys.iter().any(|k| external_ids.contains_key(*k));
    if is_tenant {
        Ownership::TenantManaged
    } else {
        Ownership::Unmanaged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_our_marker() {
        assert_eq!(classify(&our_marker()), Ownership::Ours);
    }

    #[test]
    fn classifies_tenant_marker() {
        let mut ids = ExternalIds::new();
        ids.insert(MANAGED_BY_KEY.to_string(), TENANT_MANAGED_BY_VALUE.to_string());
        assert_eq!(classify(&ids), Ownership::TenantManaged);
    }

    #[test]
    fn classifies_tenant_specific_key_without_marker() {
        let mut ids = ExternalIds::new();
        ids.insert(TENANT_VPC_UUID_KEY.to_string(), "vpc-1".to_string());
        assert_eq!(classify(&ids), Ownership::TenantManaged);
    }

    #[test]
    fn classifies_unmanaged() {
        assert_eq!(classify(&ExternalIds::new()), Ownership::Unmanaged);
    }

    #[test]
    fn classifies_unrecognized_managed_by_value_as_unmanaged() {
        let mut ids = ExternalIds::new();
        ids.insert(MANAGED_BY_KEY.to_string(), "some-random-tool".to_string());
        assert_eq!(classify(&ids), Ownership::Unmanaged);
    }
}
