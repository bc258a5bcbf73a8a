//! Publishes one OVN Load Balancer per `(namespace, name, protocol)` for
//! every ClusterIP- and NodePort-reachable Service port, attached to every
//! switch that has reached `phase == Active`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::error::ReconcileError;
use crate::events::{EventRecorder, ObjectRef};
use crate::metrics::Metrics;
use crate::model::subnet::{Subnet, SubnetPhase};
use crate::ovn::model::LoadBalancer;
use crate::ovn::ops::{Kind, UuidRef};
use crate::ovn::txn::Transaction;
use crate::ovn::NbClient;

use super::backoff_tracker::BackoffTracker;
use super::workqueue::WorkQueue;

const OWNER_MARKER: &str = "service-controller";
const SERVICE_KEY: &str = "k8s.ovn.org/service";
const OWNER_KEY: &str = "k8s.ovn.org/owner";
const KIND_KEY: &str = "k8s.ovn.org/kind";
const PROTOCOL_KEY: &str = "k8s.ovn.org/protocol";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LbKind {
    ClusterIp,
    NodePort,
}

impl LbKind {
    fn as_str(&self) -> &'static str {
        match self {
            LbKind::ClusterIp => "clusterip",
            LbKind::NodePort => "nodeport",
        }
    }
}

pub struct ServiceController {
    pub client: Client,
    pub ovn: Arc<NbClient>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<dyn EventRecorder>,
    pub queue: Arc<WorkQueue<String>>,
    backoff: BackoffTracker<String>,
}

impl ServiceController {
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
                .observe_reconcile("service", started.elapsed(), result.is_ok());
            match result {
                Ok(()) => self.backoff.reset(&key),
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next_delay(&key);
                    warn!(service = %key, error = %e, ?delay, "requeueing service after transient error");
                    self.queue.enqueue_after(key.clone(), delay);
                }
                Err(e) => warn!(service = %key, error = %e, "service reconcile failed"),
            }
            self.queue.done(&key);
        }
    }

    async fn reconcile_one(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = key.split_once('/').unwrap_or(("default", key));
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service_id = format!("{namespace}/{name}");

        let active_switches = self.active_switch_names().await;

        let Some(service) = api.get_opt(name).await.map_err(|e| {
            ReconcileError::requeue(format!("fetching service {key}: {e}"), std::time::Duration::from_secs(5))
        })?
        else {
            return self.delete_all_lbs_for(&service_id, &active_switches).await;
        };

        if service.meta().deletion_timestamp.is_some() {
            return self.delete_all_lbs_for(&service_id, &active_switches).await;
        }
        if is_excluded(&service) {
            return self.delete_all_lbs_for(&service_id, &active_switches).await;
        }

        let endpoint_slices = self.endpoint_slices_for(namespace, name).await?;
        let nodes = self.node_internal_ips().await?;

        let desired = desired_load_balancers(&service, &endpoint_slices, &nodes, &service_id);
        self.converge(&service_id, desired, &active_switches).await?;
        info!(service = %service_id, "service load balancers converged");
        Ok(())
    }

    async fn active_switch_names(&self) -> Vec<String> {
        let api: Api<Subnet> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => list
                .items
                .into_iter()
                .filter(|s| {
                    s.status
                        .as_ref()
                        .map(|st| matches!(st.phase, SubnetPhase::Active))
                        .unwrap_or(false)
                })
                .map(|s| s.logical_switch_name())
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to list subnets while resolving active switches");
                Vec::new()
            }
        }
    }

    async fn endpoint_slices_for(&self, namespace: &str, name: &str) -> Result<Vec<EndpointSlice>, ReconcileError> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("kubernetes.io/service-name={name}"));
        let list = api
            .list(&lp)
            .await
            .map_err(|e| ReconcileError::requeue(format!("listing endpointslices: {e}"), std::time::Duration::from_secs(5)))?;
        Ok(list.items)
    }

    /// Returns `(node name, node internal IP)` pairs — the name is what
    /// `EndpointSlice` entries carry as `node_name`, the IP is what the
    /// NodePort VIP is keyed by; they must not be conflated.
    async fn node_internal_ips(&self) -> Result<Vec<(String, String)>, ReconcileError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ReconcileError::requeue(format!("listing nodes: {e}"), std::time::Duration::from_secs(5)))?;
        Ok(list
            .items
            .iter()
            .filter_map(|n| {
                let name = n.metadata.name.clone()?;
                let ip = n.status.as_ref()?.addresses.as_ref()?.iter().find_map(|a| {
                    (a.type_ == "InternalIP").then(|| a.address.clone())
                })?;
                Some((name, ip))
            })
            .collect())
    }

    async fn converge(
        &self,
        service_id: &str,
        desired: BTreeMap<String, DesiredLb>,
        active_switches: &[String],
    ) -> Result<(), ReconcileError> {
        let existing = self.ovn.list_lbs_by_external_id(SERVICE_KEY, service_id).await;

        let cancel = tokio_util::sync::CancellationToken::new();
        let mut txn = Transaction::new();
        let mut lb_refs = Vec::new();

        for (lb_name, desired_lb) in &desired {
            if desired_lb.vips.is_empty() {
                continue;
            }
            match existing.iter().find(|lb| &lb.name == lb_name) {
                Some(existing_lb) => {
                    txn.update_lb_vips(lb_name.clone(), desired_lb.vips.clone());
                    if !desired_lb.options.is_empty() {
                        txn.update_lb_options(lb_name.clone(), desired_lb.options.clone());
                    }
                    lb_refs.push(UuidRef::Real(existing_lb.uuid.clone()));
                }
                None => {
                    let lb_ref = txn.insert_lb(LoadBalancer {
                        name: lb_name.clone(),
                        vips: desired_lb.vips.clone(),
                        protocol: desired_lb.protocol.clone(),
                        options: desired_lb.options.clone(),
                        external_ids: desired_lb.external_ids.clone(),
                        ..Default::default()
                    });
                    lb_refs.push(lb_ref);
                }
            }
        }
        for switch in active_switches {
            txn.mutate_switch_add_lbs(switch.clone(), lb_refs.clone());
        }

        let stale: Vec<_> = existing
            .iter()
            .filter(|lb| !desired.contains_key(&lb.name) || desired.get(&lb.name).is_some_and(|d| d.vips.is_empty()))
            .collect();
        for lb in &stale {
            let lb_ref = UuidRef::Real(lb.uuid.clone());
            for switch in active_switches {
                txn.mutate_switch_delete_lbs(switch.clone(), vec![lb_ref.clone()]);
            }
            txn.delete_row(Kind::LoadBalancer, lb.name.clone());
        }

        if !stale.is_empty() {
            info!(service = service_id, count = stale.len(), "removing stale load balancers");
        }
        self.ovn.commit("sync-service-lbs", txn, &cancel).await.map_err(ReconcileError::from)
    }

    async fn delete_all_lbs_for(&self, service_id: &str, active_switches: &[String]) -> Result<(), ReconcileError> {
        let existing = self.ovn.list_lbs_by_external_id(SERVICE_KEY, service_id).await;
        if existing.is_empty() {
            return Ok(());
        }
        let cancel = tokio_util::sync::CancellationToken::new();
        let mut txn = Transaction::new();
        for lb in &existing {
            let lb_ref = UuidRef::Real(lb.uuid.clone());
            for switch in active_switches {
                txn.mutate_switch_delete_lbs(switch.clone(), vec![lb_ref.clone()]);
            }
            txn.delete_row(Kind::LoadBalancer, lb.name.clone());
        }
        self.ovn.commit("delete-service-lbs", txn, &cancel).await.map_err(ReconcileError::from)?;
        self.events.normal(
            &ObjectRef {
                kind: "Service",
                namespace: service_id.split_once('/').map(|(ns, _)| ns),
                name: service_id.split_once('/').map(|(_, n)| n).unwrap_or(service_id),
            },
            "LoadBalancersRemoved",
            &format!("removed {} load balancer(s)", existing.len()),
        );
        Ok(())
    }
}

struct DesiredLb {
    vips: BTreeMap<String, String>,
    protocol: String,
    options: BTreeMap<String, String>,
    external_ids: BTreeMap<String, String>,
}

fn is_excluded(service: &Service) -> bool {
    let spec = match &service.spec {
        Some(s) => s,
        None => return true,
    };
    if spec.type_.as_deref() == Some("ExternalName") {
        return true;
    }
    spec.cluster_ip.as_deref() == Some("None")
}

fn lb_name(service_id: &str, protocol: &str, kind: LbKind) -> String {
    match kind {
        LbKind::ClusterIp => format!("Service_{service_id}_{}", protocol.to_lowercase()),
        LbKind::NodePort => format!("Service_{service_id}_{}_nodeport", protocol.to_lowercase()),
    }
}

fn vip_key(ip: &str, port: i32) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

/// Inverse of `vip_key`: splits a `"ip:port"` or `"[ip]:port"` OVN vips-map
/// key back into its address and port.
fn parse_vip(s: &str) -> Option<(String, i32)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (ip, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        Some((ip.to_string(), port))
    } else {
        let (ip, port) = s.rsplit_once(':')?;
        Some((ip.to_string(), port.parse().ok()?))
    }
}

struct Backend {
    ip: String,
    node_name: Option<String>,
}

fn ready_backends(slices: &[EndpointSlice], port_name: Option<&str>) -> Vec<(Backend, i32)> {
    let mut out = Vec::new();
    for slice in slices {
        for endpoint in &slice.endpoints {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            let terminating = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.terminating)
                .unwrap_or(false);
            if !ready || terminating {
                continue;
            }
            let Some(target_port) = slice
                .ports
                .as_ref()
                .and_then(|ports| ports.iter().find(|p| p.name.as_deref() == port_name))
                .and_then(|p| p.port)
            else {
                continue;
            };
            for address in &endpoint.addresses {
                out.push((
                    Backend {
                        ip: address.clone(),
                        node_name: endpoint.node_name.clone(),
                    },
                    target_port,
                ));
            }
        }
    }
    out
}

fn desired_load_balancers(
    service: &Service,
    slices: &[EndpointSlice],
    nodes: &[(String, String)],
    service_id: &str,
) -> BTreeMap<String, DesiredLb> {
    let mut out = BTreeMap::new();
    let Some(spec) = &service.spec else { return out };
    let Some(ports) = &spec.ports else { return out };
    let cluster_ip = spec.cluster_ip.clone().unwrap_or_default();
    let supports_nodeport = matches!(spec.type_.as_deref(), Some("NodePort") | Some("LoadBalancer"));
    let local_policy = spec.external_traffic_policy.as_deref() == Some("Local");

    let mut by_protocol: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut nodeport_by_protocol: BTreeMap<String, (BTreeMap<String, String>, bool)> = BTreeMap::new();

    for port in ports {
        let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
        let backends = ready_backends(slices, port.name.as_deref());

        if !cluster_ip.is_empty() {
            let entry = by_protocol.entry(protocol.clone()).or_default();
            if !backends.is_empty() {
                let value = backends
                    .iter()
                    .map(|(b, p)| vip_key(&b.ip, *p))
                    .collect::<Vec<_>>()
                    .join(",");
                entry.insert(vip_key(&cluster_ip, port.port), value);
            }
        }

        if supports_nodeport {
            if let Some(node_port) = port.node_port.filter(|p| *p > 0) {
                let entry = nodeport_by_protocol.entry(protocol.clone()).or_insert((BTreeMap::new(), local_policy));
                for (node_name, node_ip) in nodes {
                    let backends_for_node: Vec<_> = if local_policy {
                        backends
                            .iter()
                            .filter(|(b, _)| b.node_name.as_deref() == Some(node_name.as_str()))
                            .collect()
                    } else {
                        backends.iter().collect()
                    };
                    if backends_for_node.is_empty() {
                        continue;
                    }
                    let value = backends_for_node
                        .iter()
                        .map(|(b, p)| vip_key(&b.ip, *p))
                        .collect::<Vec<_>>()
                        .join(",");
                    entry.0.insert(vip_key(node_ip, node_port), value);
                }
            }
        }
    }

    for (protocol, vips) in by_protocol {
        let name = lb_name(service_id, &protocol, LbKind::ClusterIp);
        let mut external_ids = BTreeMap::new();
        external_ids.insert(SERVICE_KEY.to_string(), service_id.to_string());
        external_ids.insert(OWNER_KEY.to_string(), OWNER_MARKER.to_string());
        external_ids.insert(KIND_KEY.to_string(), LbKind::ClusterIp.as_str().to_string());
        external_ids.insert(PROTOCOL_KEY.to_string(), protocol.clone());
        out.insert(
            name,
            DesiredLb {
                vips,
                protocol,
                options: BTreeMap::new(),
                external_ids,
            },
        );
    }

    for (protocol, (vips, local)) in nodeport_by_protocol {
        let name = lb_name(service_id, &protocol, LbKind::NodePort);
        let mut external_ids = BTreeMap::new();
        external_ids.insert(SERVICE_KEY.to_string(), service_id.to_string());
        external_ids.insert(OWNER_KEY.to_string(), OWNER_MARKER.to_string());
        external_ids.insert(KIND_KEY.to_string(), LbKind::NodePort.as_str().to_string());
        external_ids.insert(PROTOCOL_KEY.to_string(), protocol.clone());
        let mut options = BTreeMap::new();
        if local {
            options.insert("skip_snat".to_string(), "true".to_string());
        }
        out.insert(
            name,
            DesiredLb {
                vips,
                protocol,
                options,
                external_ids,
            },
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::*;

    #[test]
    fn vip_key_brackets_ipv6() {
        assert_eq!(vip_key("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(vip_key("::1", 80), "[::1]:80");
    }

    #[test]
    fn parse_vip_inverts_vip_key() {
        assert_eq!(parse_vip("10.0.0.1:80"), Some(("10.0.0.1".to_string(), 80)));
        assert_eq!(parse_vip("[::1]:80"), Some(("::1".to_string(), 80)));
        assert_eq!(parse_vip("not-a-vip"), None);
    }

    quickcheck! {
        fn vip_round_trip(a: u8, b: u8, c: u8, d: u8, port: u16) -> TestResult {
            if port == 0 {
                return TestResult::discard();
            }
            let ip = format!("{a}.{b}.{c}.{d}");
            let port = port as i32;
            let round_tripped = parse_vip(&vip_key(&ip, port));
            TestResult::from_bool(round_tripped == Some((ip, port)))
        }
    }

    #[test]
    fn lb_naming_matches_scheme() {
        assert_eq!(lb_name("default/nginx", "TCP", LbKind::ClusterIp), "Service_default/nginx_tcp");
        assert_eq!(
            lb_name("default/nginx", "TCP", LbKind::NodePort),
            "Service_default/nginx_tcp_nodeport"
        );
    }

    #[test]
    fn headless_service_is_excluded() {
        let svc = Service {
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_excluded(&svc));
    }

    #[test]
    fn external_name_service_is_excluded() {
        let svc = Service {
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                type_: Some("ExternalName".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_excluded(&svc));
    }

    #[test]
    fn local_traffic_policy_filters_by_node_name_not_ip() {
        use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
        use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort};

        let slice = EndpointSlice {
            endpoints: vec![
                Endpoint {
                    addresses: vec!["10.244.0.5".to_string()],
                    node_name: Some("node-1".to_string()),
                    ..Default::default()
                },
                Endpoint {
                    addresses: vec!["10.244.0.6".to_string()],
                    node_name: Some("node-2".to_string()),
                    ..Default::default()
                },
            ],
            ports: Some(vec![EndpointPort {
                name: None,
                port: Some(8080),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let service = Service {
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                external_traffic_policy: Some("Local".to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    node_port: Some(30080),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        // node names differ from their IPs on purpose: a name/IP mixup
        // would make the Local-policy filter match nothing.
        let nodes = vec![
            ("node-1".to_string(), "10.0.0.5".to_string()),
            ("node-2".to_string(), "10.0.0.6".to_string()),
        ];

        let desired = desired_load_balancers(&service, &[slice], &nodes, "default/svc");
        let nodeport_lb = desired.get("Service_default/svc_tcp_nodeport").unwrap();

        assert_eq!(nodeport_lb.vips.len(), 2);
        assert_eq!(
            nodeport_lb.vips.get("10.0.0.5:30080").unwrap(),
            "10.244.0.5:8080"
        );
        assert_eq!(
            nodeport_lb.vips.get("10.0.0.6:30080").unwrap(),
            "10.244.0.6:8080"
        );
    }

    #[test]
    fn ordinary_clusterip_service_is_included() {
        let svc = Service {
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                cluster_ip: Some("10.96.0.1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!is_excluded(&svc));
    }
}
