//! The pod-network record: computed by the Pod controller, serialized into
//! a Kubernetes annotation for the node-side CNI binary to read.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

pub const ANNOTATION_KEY: &str = "k8s.ovn.org/pod-networks";
pub const FLAT_POD_IP: &str = "zstack.io/pod-ip";
pub const FLAT_POD_MAC: &str = "zstack.io/pod-mac";
pub const FLAT_SUBNET: &str = "zstack.io/subnet";
pub const FLAT_LOGICAL_SWITCH: &str = "zstack.io/logical-switch";
pub const FLAT_LOGICAL_SWITCH_PORT: &str = "zstack.io/logical-switch-port";
pub const SUBNET_REQUEST_ANNOTATION: &str = "zstack.io/subnet";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    pub dest: String,
    pub next_hop: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PodNetworkAnnotation {
    pub ip_addresses: Vec<String>,
    pub mac_address: String,
    pub gateway_ips: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    pub logical_switch: String,
    pub logical_switch_port: String,
    pub subnet: String,
}

impl PodNetworkAnnotation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ip_with_prefix: Ipv4Net,
        mac: impl Into<String>,
        gateway: Ipv4Addr,
        routes: Vec<RouteSpec>,
        logical_switch: impl Into<String>,
        logical_switch_port: impl Into<String>,
        subnet: impl Into<String>,
    ) -> Self {
        Self {
            ip_addresses: vec![ip_with_prefix.to_string()],
            mac_address: mac.into(),
            gateway_ips: vec![gateway.to_string()],
            routes,
            logical_switch: logical_switch.into(),
            logical_switch_port: logical_switch_port.into(),
            subnet: subnet.into(),
        }
    }

    pub fn pod_ip(&self) -> Option<&str> {
        self.ip_addresses
            .first()
            .map(|s| s.split('/').next().unwrap_or(s))
    }

    /// Validates that `ip_addresses`/`gateway_ips` parse as IP/CIDR and
    /// `mac_address` parses as a 48-bit MAC.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.ip_addresses.is_empty() {
            return Err(ReconcileError::Validation {
                field: "ip_addresses".into(),
                message: "must not be empty".into(),
            });
        }
        for addr in &self.ip_addresses {
            addr.parse::<Ipv4Net>().map_err(|e| ReconcileError::Validation {
                field: "ip_addresses".into(),
                message: format!("'{addr}' is not a valid ip/cidr: {e}"),
            })?;
        }
        for gw in &self.gateway_ips {
            gw.parse::<Ipv4Addr>().map_err(|e| ReconcileError::Validation {
                field: "gateway_ips".into(),
                message: format!("'{gw}' is not a valid ip: {e}"),
            })?;
        }
        parse_mac(&self.mac_address).map_err(|e| ReconcileError::Validation {
            field: "mac_address".into(),
            message: e,
        })?;
        Ok(())
    }

    /// Renders both the structured JSON annotation and the mirrored flat
    /// keys used by components that don't want to parse JSON.
    pub fn set(&self, annotations: &mut BTreeMap<String, String>) -> Result<(), ReconcileError> {
        self.validate()?;
        let json = serde_json::to_string(self).map_err(|e| ReconcileError::Validation {
            field: "pod-networks".into(),
            message: e.to_string(),
        })?;
        annotations.insert(ANNOTATION_KEY.to_string(), json);
        if let Some(ip) = self.pod_ip() {
            annotations.insert(FLAT_POD_IP.to_string(), ip.to_string());
        }
        annotations.insert(FLAT_POD_MAC.to_string(), self.mac_address.clone());
        annotations.insert(FLAT_SUBNET.to_string(), self.subnet.clone());
        annotations.insert(FLAT_LOGICAL_SWITCH.to_string(), self.logical_switch.clone());
        annotations.insert(
            FLAT_LOGICAL_SWITCH_PORT.to_string(),
            self.logical_switch_port.clone(),
        );
        Ok(())
    }

    pub fn get(annotations: &BTreeMap<String, String>) -> Option<Self> {
        annotations
            .get(ANNOTATION_KEY)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

fn parse_mac(s: &str) -> Result<[u8; 6], String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("'{s}' does not have 6 octets"));
    }
    let mut out = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).map_err(|_| format!("'{s}' has a non-hex octet '{p}'"))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PodNetworkAnnotation {
        PodNetworkAnnotation::new(
            "10.244.1.2/24".parse().unwrap(),
            "0a:58:0a:f4:01:02",
            "10.244.1.1".parse().unwrap(),
            vec![],
            "subnet-default",
            "default_nginx",
            "default",
        )
    }

    #[test]
    fn newly_built_annotation_validates() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn set_then_get_roundtrips() {
        let a = sample();
        let mut annotations = BTreeMap::new();
        a.set(&mut annotations).unwrap();
        assert_eq!(annotations.get(FLAT_POD_IP).map(String::as_str), Some("10.244.1.2"));
        let back = PodNetworkAnnotation::get(&annotations).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn rejects_bad_mac() {
        let mut a = sample();
        a.mac_address = "not-a-mac".into();
        assert!(a.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_ip_cidr() {
        let mut a = sample();
        a.ip_addresses = vec!["not-an-ip".into()];
        assert!(a.validate().is_err());
    }
}
