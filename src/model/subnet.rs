//! The `Subnet` custom resource: a cluster-scoped pool of pod addresses
//! backed by one OVN logical switch.

use chrono::{DateTime, Utc};
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const FINALIZER: &str = "subnet.network.zstack.io/finalizer";

/// Desired state of a `Subnet`. More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "network.zstack.io",
    version = "v1",
    kind = "Subnet",
    plural = "subnets",
    singular = "subnet",
    shortname = "sn",
    status = "SubnetStatus",
    printcolumn = r#"{"name":"CIDR","type":"string","jsonPath":".spec.cidr"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableIPs"}"#,
    printcolumn = r#"{"name":"Used","type":"integer","jsonPath":".status.usedIPs"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// IPv4 CIDR of the subnet, e.g. `10.244.1.0/24`.
    pub cidr: String,

    /// Gateway address, implicitly excluded from allocation.
    pub gateway: String,

    /// Individual IPs or inclusive `a.b.c.d-a.b.c.e` ranges withheld from
    /// allocation in addition to the gateway.
    #[serde(default)]
    pub exclude_ips: Vec<String>,

    /// Name of a pre-existing logical switch. Non-empty puts the subnet in
    /// external mode: the switch is referenced, never created or deleted by us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_logical_switch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default)]
    pub protocol: Protocol,

    /// Whether unannotated pods without a namespace match fall back to this subnet.
    #[serde(default)]
    pub default: bool,

    /// Namespaces that resolve to this subnet when a pod carries no explicit
    /// subnet annotation.
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default)]
    pub enable_dhcp: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum Protocol {
    #[default]
    IPv4,
    IPv6,
    Dual,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum SubnetPhase {
    #[default]
    Pending,
    Active,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum ConditionType {
    Ready,
    LogicalSwitchReady,
    IPPoolReady,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub struct SubnetCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Most recent observed status of a `Subnet`, mutated exclusively by the
/// Subnet controller.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    #[serde(default)]
    pub phase: SubnetPhase,
    #[serde(default)]
    pub available_ips: i64,
    #[serde(default)]
    pub used_ips: i64,
    #[serde(default)]
    pub logical_switch: String,
    #[serde(default)]
    pub conditions: Vec<SubnetCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Subnet {
    /// `isExternalMode(S) ≡ S.externalLogicalSwitch ≠ ""`
    pub fn is_external_mode(&self) -> bool {
        self.spec
            .external_logical_switch
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// `logicalSwitchName(S) = S.externalLogicalSwitch` if external,
    /// else `"subnet-" + S.name`.
    pub fn logical_switch_name(&self) -> String {
        match &self.spec.external_logical_switch {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("subnet-{}", self.name()),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn subnet(name: &str, external: Option<&str>) -> Subnet {
        Subnet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: SubnetSpec {
                cidr: "10.244.1.0/24".into(),
                gateway: "10.244.1.1".into(),
                external_logical_switch: external.map(str::to_string),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn standalone_mode_names_switch_after_subnet() {
        let s = subnet("s1", None);
        assert!(!s.is_external_mode());
        assert_eq!(s.logical_switch_name(), "subnet-s1");
    }

    #[test]
    fn external_mode_references_named_switch() {
        let s = subnet("s1", Some("ls-zstack-flat-abc"));
        assert!(s.is_external_mode());
        assert_eq!(s.logical_switch_name(), "ls-zstack-flat-abc");
    }

    #[test]
    fn empty_external_switch_is_still_standalone() {
        let s = subnet("s1", Some(""));
        assert!(!s.is_external_mode());
    }
}
