//! Translates each `NetworkPolicy` into default-deny + allow ACLs addressed
//! at the IPs of the pods it selects. Updates are delete-and-re-emit: no
//! differential ACL diffing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::error::ReconcileError;
use crate::events::{EventRecorder, ObjectRef};
use crate::match_expr::{Expr, Field};
use crate::metrics::Metrics;
use crate::ovn::model::{Acl, Action, Direction};
use crate::ovn::ops::{Kind, UuidRef};
use crate::ovn::txn::Transaction;
use crate::ovn::NbClient;

use super::backoff_tracker::BackoffTracker;
use super::workqueue::WorkQueue;

const POLICY_KEY: &str = "k8s.ovn.org/policy";
const NAMESPACE_KEY: &str = "k8s.ovn.org/namespace";
const DIRECTION_KEY: &str = "k8s.ovn.org/direction";

const DEFAULT_DENY_PRIORITY: i32 = 1000;

pub struct NetworkPolicyController {
    pub client: Client,
    pub ovn: Arc<NbClient>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<dyn EventRecorder>,
    pub queue: Arc<WorkQueue<String>>,
    backoff: BackoffTracker<String>,
}

impl NetworkPolicyController {
    pub fn new(client: Client, ovn: Arc<NbClient>, metrics: Arc<Metrics>, events: Arc<dyn EventRecorder>) -> Self {
        Self {
            client,
            ovn,
            metrics,
            events,
            queue: WorkQueue::new(),
            backoff: BackoffTracker::new(),
        }
    }

    pub async fn run_worker(&self) {
        while let Some(key) = self.queue.get().await {
            let started = Instant::now();
            let result = self.reconcile_one(&key).await;
            self.metrics
                .observe_reconcile("networkpolicy", started.elapsed(), result.is_ok());
            match result {
                Ok(()) => self.backoff.reset(&key),
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next_delay(&key);
                    warn!(policy = %key, error = %e, ?delay, "requeueing networkpolicy after transient error");
                    self.queue.enqueue_after(key.clone(), delay);
                }
                Err(e) => warn!(policy = %key, error = %e, "networkpolicy reconcile failed"),
            }
            self.queue.done(&key);
        }
    }

    async fn reconcile_one(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = key.split_once('/').unwrap_or(("default", key));
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let policy_id = format!("{namespace}/{name}");

        let Some(policy) = api.get_opt(name).await.map_err(|e| {
            ReconcileError::requeue(format!("fetching networkpolicy {key}: {e}"), Duration::from_secs(5))
        })?
        else {
            return self.delete_acls_for(&policy_id).await;
        };
        if policy.meta().deletion_timestamp.is_some() {
            return self.delete_acls_for(&policy_id).await;
        }

        let spec = policy.spec.as_ref().ok_or_else(|| ReconcileError::Validation {
            field: "spec".into(),
            message: "networkpolicy has no spec".into(),
        })?;

        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selected_ips = selected_pod_ips(&pods_api, &spec.pod_selector).await?;

        self.delete_acls_for(&policy_id).await?;
        if selected_ips.is_empty() {
            info!(policy = %policy_id, "no pods match podSelector, no acls emitted");
            return Ok(());
        }

        let policy_types = effective_policy_types(spec);
        let mut acls = Vec::new();

        if policy_types.iter().any(|t| t == "Ingress") {
            acls.push(default_deny_acl(&policy_id, namespace, Direction::ToLport, &selected_ips));
            for (idx, rule) in spec.ingress.as_deref().unwrap_or_default().iter().enumerate() {
                acls.extend(
                    self.ingress_rule_acls(&policy_id, namespace, idx, rule, &selected_ips)
                        .await?,
                );
            }
        }
        if policy_types.iter().any(|t| t == "Egress") {
            acls.push(default_deny_acl(&policy_id, namespace, Direction::FromLport, &selected_ips));
            for (idx, rule) in spec.egress.as_deref().unwrap_or_default().iter().enumerate() {
                acls.extend(
                    self.egress_rule_acls(&policy_id, namespace, idx, rule, &selected_ips)
                        .await?,
                );
            }
        }

        let cancel = tokio_util::sync::CancellationToken::new();
        let mut txn = Transaction::new();
        let acl_refs: Vec<UuidRef> = acls.into_iter().map(|acl| txn.insert_acl(acl)).collect();
        // ACLs attach to every switch carrying a selected pod; since pods can
        // span only their own subnet's switch, and we don't track per-pod
        // switch membership here, attach to the union of switches hosting a
        // selected pod, resolved via the OVN port rows themselves.
        let switches = self.switches_for_pods(&selected_ips).await;
        for switch in &switches {
            txn.mutate_switch_add_acls(switch.clone(), acl_refs.clone());
        }
        self.ovn
            .commit("sync-networkpolicy-acls", txn, &cancel)
            .await
            .map_err(ReconcileError::from)?;

        self.events.normal(
            &ObjectRef {
                kind: "NetworkPolicy",
                namespace: Some(namespace),
                name,
            },
            "AclsSynced",
            &format!("{} pod(s) selected", selected_ips.len()),
        );
        Ok(())
    }

    async fn ingress_rule_acls(
        &self,
        policy_id: &str,
        namespace: &str,
        rule_idx: usize,
        rule: &NetworkPolicyIngressRule,
        selected_ips: &[String],
    ) -> Result<Vec<Acl>, ReconcileError> {
        let port_clause = render_ports(rule.ports.as_deref());
        let peers = self.resolve_peers(namespace, rule.from.as_deref()).await?;
        Ok(build_rule_acls(
            policy_id,
            namespace,
            rule_idx,
            Direction::ToLport,
            Field::Ip4Dst,
            Field::Ip4Src,
            selected_ips,
            &peers,
            &port_clause,
        ))
    }

    async fn egress_rule_acls(
        &self,
        policy_id: &str,
        namespace: &str,
        rule_idx: usize,
        rule: &NetworkPolicyEgressRule,
        selected_ips: &[String],
    ) -> Result<Vec<Acl>, ReconcileError> {
        let port_clause = render_ports(rule.ports.as_deref());
        let peers = self.resolve_peers(namespace, rule.to.as_deref()).await?;
        Ok(build_rule_acls(
            policy_id,
            namespace,
            rule_idx,
            Direction::FromLport,
            Field::Ip4Src,
            Field::Ip4Dst,
            selected_ips,
            &peers,
            &port_clause,
        ))
    }

    /// Resolves `ipBlock` CIDRs directly and pod-/namespace-selector peers
    /// by querying matching pods' `status.podIP` at reconcile time.
    async fn resolve_peers(
        &self,
        namespace: &str,
        peers: Option<&[NetworkPolicyPeer]>,
    ) -> Result<Vec<Peer>, ReconcileError> {
        let Some(peers) = peers else {
            return Ok(vec![Peer::Any]);
        };
        let mut out = Vec::new();
        for peer in peers {
            if let Some(ip_block) = &peer.ip_block {
                out.push(Peer::Cidr(ip_block.cidr.clone()));
                continue;
            }
            let target_namespace = match &peer.namespace_selector {
                Some(_) => None, // any namespace; narrowed below by listing across namespaces is out of scope, default to current ns
                None => Some(namespace),
            };
            let selector = peer.pod_selector.clone().unwrap_or_default();
            let ns = target_namespace.unwrap_or(namespace);
            let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
            let ips = selected_pod_ips(&pods_api, &selector).await?;
            if !ips.is_empty() {
                out.push(Peer::Ips(ips));
            }
        }
        Ok(out)
    }

    /// Ports don't carry their switch's name, so this cross-references every
    /// switch's port-uuid list against the uuids of ports whose addresses
    /// match a selected pod IP.
    async fn switches_for_pods(&self, pod_ips: &[String]) -> Vec<String> {
        let ports = self.ovn.list_ports().await;
        let matching_uuids: std::collections::BTreeSet<String> = ports
            .iter()
            .filter(|port| {
                port.addresses
                    .iter()
                    .any(|addr| pod_ips.iter().any(|ip| addr.ends_with(ip.as_str())))
            })
            .map(|port| port.uuid.clone())
            .collect();
        if matching_uuids.is_empty() {
            return Vec::new();
        }
        self.ovn
            .list_switches()
            .await
            .into_iter()
            .filter(|sw| sw.ports.iter().any(|p| matching_uuids.contains(p)))
            .map(|sw| sw.name)
            .collect()
    }

    async fn delete_acls_for(&self, policy_id: &str) -> Result<(), ReconcileError> {
        let existing = self.ovn.list_acls_by_external_id(POLICY_KEY, policy_id).await;
        if existing.is_empty() {
            return Ok(());
        }
        let cancel = tokio_util::sync::CancellationToken::new();
        let mut txn = Transaction::new();
        let switches = self.all_switches().await;
        let acl_refs: Vec<UuidRef> = existing.iter().map(|a| UuidRef::Real(a.uuid.clone())).collect();
        for switch in &switches {
            txn.mutate_switch_delete_acls(switch.clone(), acl_refs.clone());
        }
        for acl in &existing {
            txn.delete_row(Kind::Acl, acl.uuid.clone());
        }
        self.ovn
            .commit("delete-networkpolicy-acls", txn, &cancel)
            .await
            .map_err(ReconcileError::from)
    }

    async fn all_switches(&self) -> Vec<String> {
        self.ovn.list_switches().await.into_iter().map(|s| s.name).collect()
    }
}

#[derive(Debug, Clone)]
enum Peer {
    Any,
    Cidr(String),
    Ips(Vec<String>),
}

fn effective_policy_types(spec: &k8s_openapi::api::networking::v1::NetworkPolicySpec) -> Vec<String> {
    if let Some(types) = &spec.policy_types {
        return types.clone();
    }
    let mut types = vec!["Ingress".to_string()];
    if spec.egress.is_some() {
        types.push("Egress".to_string());
    }
    types
}

fn default_deny_acl(policy_id: &str, namespace: &str, direction: Direction, selected_ips: &[String]) -> Acl {
    let field = match direction {
        Direction::ToLport => Field::Ip4Dst,
        Direction::FromLport => Field::Ip4Src,
    };
    let match_ = Expr::Or(selected_ips.iter().map(|ip| Expr::atom(field, ip.clone())).collect()).render();
    let mut external_ids = BTreeMap::new();
    external_ids.insert(POLICY_KEY.to_string(), policy_id.to_string());
    external_ids.insert(NAMESPACE_KEY.to_string(), namespace.to_string());
    external_ids.insert(DIRECTION_KEY.to_string(), direction.as_str().to_string());
    Acl {
        uuid: String::new(),
        direction,
        priority: DEFAULT_DENY_PRIORITY,
        match_,
        action: Action::Drop,
        external_ids,
        log: false,
        severity: None,
    }
}

fn render_ports(ports: Option<&[NetworkPolicyPort]>) -> String {
    let Some(ports) = ports else { return String::new() };
    let atoms: Vec<Expr> = ports
        .iter()
        .filter_map(|p| {
            // named ports (IntOrString::String) aren't resolved against pod
            // container specs here; skip rather than guess a numeric value
            let port = match p.port.as_ref()? {
                k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n) => *n,
                k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(_) => return None,
            };
            let field = match p.protocol.as_deref() {
                Some("UDP") => Field::UdpDst,
                Some("SCTP") => Field::SctpDst,
                _ => Field::TcpDst,
            };
            Some(match &p.end_port {
                Some(end) => Expr::And(vec![
                    Expr::cmp(field, crate::match_expr::Op::Ge, port.to_string()),
                    Expr::cmp(field, crate::match_expr::Op::Le, end.to_string()),
                ]),
                None => Expr::atom(field, port.to_string()),
            })
        })
        .collect();
    Expr::Or(atoms).render()
}

#[allow(clippy::too_many_arguments)]
fn build_rule_acls(
    policy_id: &str,
    namespace: &str,
    rule_idx: usize,
    direction: Direction,
    selected_field: Field,
    peer_field: Field,
    selected_ips: &[String],
    peers: &[Peer],
    port_clause: &str,
) -> Vec<Acl> {
    let selected_clause = Expr::Or(selected_ips.iter().map(|ip| Expr::atom(selected_field, ip.clone())).collect()).render();

    let mut out = Vec::new();
    for peer in peers {
        let peer_clause = match peer {
            Peer::Any => String::new(),
            Peer::Cidr(cidr) => Expr::atom(peer_field, cidr.clone()).render(),
            Peer::Ips(ips) => {
                if ips.is_empty() {
                    continue;
                }
                Expr::Or(ips.iter().map(|ip| Expr::atom(peer_field, ip.clone())).collect()).render()
            }
        };
        let rendered = join_and([selected_clause.as_str(), peer_clause.as_str(), port_clause]);
        if rendered.is_empty() {
            continue;
        }
        let mut external_ids = BTreeMap::new();
        external_ids.insert(POLICY_KEY.to_string(), policy_id.to_string());
        external_ids.insert(NAMESPACE_KEY.to_string(), namespace.to_string());
        external_ids.insert(DIRECTION_KEY.to_string(), direction.as_str().to_string());
        out.push(Acl {
            uuid: String::new(),
            direction,
            priority: 1001 + rule_idx as i32,
            match_: rendered,
            action: Action::Allow,
            external_ids,
            log: false,
            severity: None,
        });
    }
    out
}

fn join_and<'a>(clauses: impl IntoIterator<Item = &'a str>) -> String {
    clauses
        .into_iter()
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(" && ")
}

async fn selected_pod_ips(pods_api: &Api<Pod>, selector: &LabelSelector) -> Result<Vec<String>, ReconcileError> {
    let list = pods_api
        .list(&ListParams::default())
        .await
        .map_err(|e| ReconcileError::requeue(format!("listing pods: {e}"), Duration::from_secs(5)))?;
    Ok(list
        .items
        .into_iter()
        .filter(|pod| matches_selector(pod.labels(), selector))
        .filter_map(|pod| pod.status.and_then(|s| s.pod_ip))
        .collect())
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &LabelSelector) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        if !match_labels.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return false;
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let ok = match expr.operator.as_str() {
                "In" => expr
                    .values
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|v| labels.get(&expr.key).map(String::as_str) == Some(v.as_str())),
                "NotIn" => !expr
                    .values
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|v| labels.get(&expr.key).map(String::as_str) == Some(v.as_str())),
                "Exists" => labels.contains_key(&expr.key),
                "DoesNotExist" => !labels.contains_key(&expr.key),
                _ => true,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_labels_requires_every_pair() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        let mut match_labels = BTreeMap::new();
        match_labels.insert("app".to_string(), "web".to_string());
        let selector = LabelSelector {
            match_labels: Some(match_labels),
            ..Default::default()
        };
        assert!(matches_selector(&labels, &selector));

        let mut mismatched = BTreeMap::new();
        mismatched.insert("app".to_string(), "db".to_string());
        let selector2 = LabelSelector {
            match_labels: Some(mismatched),
            ..Default::default()
        };
        assert!(!matches_selector(&labels, &selector2));
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(matches_selector(&BTreeMap::new(), &LabelSelector::default()));
    }

    #[test]
    fn default_deny_acl_has_priority_1000() {
        let ips = vec!["10.244.1.5".to_string(), "10.244.1.6".to_string()];
        let acl = default_deny_acl("default/allow-web", "default", Direction::ToLport, &ips);
        assert_eq!(acl.priority, 1000);
        assert_eq!(acl.match_, "(ip4.dst == 10.244.1.5 || ip4.dst == 10.244.1.6)");
        assert!(matches!(acl.action, Action::Drop));
    }

    #[test]
    fn ingress_rule_allow_acl_priority_is_1001_plus_index() {
        let ips = vec!["10.244.1.5".to_string()];
        let peers = vec![Peer::Cidr("10.244.2.0/24".to_string())];
        let acls = build_rule_acls(
            "default/allow-web",
            "default",
            2,
            Direction::ToLport,
            Field::Ip4Dst,
            Field::Ip4Src,
            &ips,
            &peers,
            "",
        );
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].priority, 1003);
        assert_eq!(acls[0].match_, "ip4.dst == 10.244.1.5 && ip4.src == 10.244.2.0/24");
    }

    #[test]
    fn effective_policy_types_defaults_to_ingress_only() {
        let spec = k8s_openapi::api::networking::v1::NetworkPolicySpec {
            policy_types: None,
            egress: None,
            ..Default::default()
        };
        assert_eq!(effective_policy_types(&spec), vec!["Ingress".to_string()]);
    }

    #[test]
    fn effective_policy_types_adds_egress_when_egress_rules_present() {
        let spec = k8s_openapi::api::networking::v1::NetworkPolicySpec {
            policy_types: None,
            egress: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(
            effective_policy_types(&spec),
            vec!["Ingress".to_string(), "Egress".to_string()]
        );
    }
}
