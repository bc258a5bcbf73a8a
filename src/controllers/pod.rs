//! Allocates an IP per managed Pod, creates its logical switch port, and
//! sets the pod-network annotation the node CNI binary reads.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::allocator::{AllocatorRegistry, SubnetAllocator};
use crate::error::ReconcileError;
use crate::events::{EventRecorder, ObjectRef};
use crate::mac::derive_mac;
use crate::metrics::Metrics;
use crate::model::pod_annotation::{PodNetworkAnnotation, SUBNET_REQUEST_ANNOTATION};
use crate::model::subnet::{Subnet, SubnetPhase};
use crate::ovn::model::LogicalSwitchPort;
use crate::ovn::ops::Kind;
use crate::ovn::NbClient;

use super::backoff_tracker::BackoffTracker;
use super::workqueue::WorkQueue;

pub const FINALIZER: &str = "pod.network.zstack.io/finalizer";
pub const OWNER_MARKER: &str = "pod-controller";

pub struct PodController {
    pub client: Client,
    pub ovn: Arc<NbClient>,
    pub registry: AllocatorRegistry,
    pub metrics: Arc<Metrics>,
    pub events: Arc<dyn EventRecorder>,
    pub queue: Arc<WorkQueue<String>>,
    backoff: BackoffTracker<String>,
}

impl PodController {
    pub fn new(
        client: Client,
        ovn: Arc<NbClient>,
        registry: AllocatorRegistry,
        metrics: Arc<Metrics>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            client,
            ovn,
            registry,
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
                .observe_reconcile("pod", started.elapsed(), result.is_ok());
            match result {
                Ok(()) => self.backoff.reset(&key),
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next_delay(&key);
                    warn!(pod = %key, error = %e, ?delay, "requeueing pod after transient error");
                    self.queue.enqueue_after(key.clone(), delay);
                }
                Err(e) => warn!(pod = %key, error = %e, "pod reconcile failed"),
            }
            self.queue.done(&key);
        }
    }

    async fn reconcile_one(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = split_key(key);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let Some(pod) = api.get_opt(name).await.map_err(|e| {
            ReconcileError::requeue(format!("fetching pod {key}: {e}"), Duration::from_secs(5))
        })?
        else {
            return Ok(());
        };

        if pod.meta().deletion_timestamp.is_some() {
            return self.handle_deletion(&api, &pod).await;
        }
        if !is_managed(&pod) {
            return Ok(());
        }
        if PodNetworkAnnotation::get(pod.annotations()).is_some() {
            return Ok(());
        }
        self.handle_apply(&api, &pod).await
    }

    async fn handle_apply(&self, api: &Api<Pod>, pod: &Pod) -> Result<(), ReconcileError> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        ensure_finalizer(api, pod).await?;

        let subnet_api: Api<Subnet> = Api::all(self.client.clone());
        let subnets = subnet_api
            .list(&Default::default())
            .await
            .map_err(|e| ReconcileError::requeue(format!("listing subnets: {e}"), Duration::from_secs(5)))?;
        let subnet = resolve_subnet(&subnets.items, pod.annotations(), &namespace).ok_or_else(|| {
            ReconcileError::requeue("no active subnet available yet".to_string(), Duration::from_secs(5))
        })?;
        let subnet_name = subnet.name().to_string();

        let allocator = self.registry.get(&subnet_name).ok_or_else(|| {
            ReconcileError::requeue(
                format!("allocator for subnet '{subnet_name}' not registered yet"),
                Duration::from_secs(5),
            )
        })?;

        let started = Instant::now();
        let ip = allocator.allocate_next()?;
        self.metrics.observe_allocation(&subnet_name, started.elapsed(), true);
        self.metrics
            .set_allocator_gauges(&subnet_name, allocator.available() as i64, allocator.used() as i64);

        match self.create_port_and_annotate(api, pod, &subnet, &subnet_name, ip).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // release on any failure between allocation and annotation persistence
                let _ = allocator.release(ip);
                self.metrics
                    .set_allocator_gauges(&subnet_name, allocator.available() as i64, allocator.used() as i64);
                Err(e)
            }
        }
    }

    async fn create_port_and_annotate(
        &self,
        api: &Api<Pod>,
        pod: &Pod,
        subnet: &Subnet,
        subnet_name: &str,
        ip: Ipv4Addr,
    ) -> Result<(), ReconcileError> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let prefix = subnet.spec.cidr.parse::<Ipv4Net>().map(|n| n.prefix_len()).unwrap_or(24);
        let ip_with_prefix: Ipv4Net = Ipv4Net::new(ip, prefix).expect("prefix derived from a valid cidr");
        let mac = derive_mac(ip);
        let port_name = format!("{namespace}_{name}");
        let switch_name = subnet.logical_switch_name();

        let mut external_ids = BTreeMap::new();
        external_ids.insert("namespace".to_string(), namespace.clone());
        external_ids.insert("pod".to_string(), name.clone());
        external_ids.insert("pod-uid".to_string(), pod.uid().unwrap_or_default());
        external_ids.insert("owner".to_string(), OWNER_MARKER.to_string());
        external_ids.insert("subnet".to_string(), subnet_name.to_string());

        let mut txn = crate::ovn::txn::Transaction::new();
        let addr = format!("{mac} {ip}");
        let port_ref = txn.insert_port(LogicalSwitchPort {
            name: port_name.clone(),
            addresses: vec![addr.clone()],
            port_security: vec![addr],
            external_ids,
            ..Default::default()
        });
        txn.mutate_switch_add_ports(switch_name.clone(), vec![port_ref]);

        let cancel = tokio_util::sync::CancellationToken::new();
        self.ovn
            .commit("create-pod-port", txn, &cancel)
            .await
            .map_err(ReconcileError::from)?;

        let annotation = PodNetworkAnnotation::new(
            ip_with_prefix,
            mac,
            subnet.spec.gateway.parse().map_err(|e| ReconcileError::Validation {
                field: "gateway".into(),
                message: format!("{e}"),
            })?,
            vec![],
            switch_name,
            port_name,
            subnet_name,
        );
        let mut annotations = pod.annotations().clone();
        annotation.set(&mut annotations)?;
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(&name, &PatchParams::apply("pod-controller"), &Patch::Merge(patch))
            .await
            .map_err(|e| ReconcileError::requeue(format!("patching pod annotations: {e}"), Duration::from_secs(5)))?;
        info!(pod = %format!("{namespace}/{name}"), %ip, "pod network configured");
        self.events.normal(
            &ObjectRef {
                kind: "Pod",
                namespace: Some(&namespace),
                name: &name,
            },
            "NetworkConfigured",
            &format!("assigned {ip} on subnet {subnet_name}"),
        );
        Ok(())
    }

    async fn handle_deletion(&self, api: &Api<Pod>, pod: &Pod) -> Result<(), ReconcileError> {
        if !pod.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        if let Some(annotation) = PodNetworkAnnotation::get(pod.annotations()) {
            let cancel = tokio_util::sync::CancellationToken::new();
            let mut txn = crate::ovn::txn::Transaction::new();
            if let Some(port) = self.ovn.get_port(&annotation.logical_switch_port).await {
                txn.mutate_switch_delete_ports(
                    annotation.logical_switch.clone(),
                    vec![crate::ovn::ops::UuidRef::Real(port.uuid)],
                );
            }
            txn.delete_row(Kind::LogicalSwitchPort, &annotation.logical_switch_port);
            self.ovn
                .commit("delete-pod-port", txn, &cancel)
                .await
                .map_err(ReconcileError::from)?;

            if let (Some(allocator), Some(ip)) = (
                self.registry.get(&annotation.subnet),
                annotation.pod_ip().and_then(|s| s.parse::<Ipv4Addr>().ok()),
            ) {
                let _ = allocator.release(ip);
                self.metrics.set_allocator_gauges(
                    &annotation.subnet,
                    allocator.available() as i64,
                    allocator.used() as i64,
                );
            }
        }
        remove_finalizer(api, pod).await?;
        Ok(())
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("default", key))
}

fn is_managed(pod: &Pod) -> bool {
    let host_network = pod.spec.as_ref().and_then(|s| s.host_network).unwrap_or(false);
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
    let terminal = matches!(phase, "Succeeded" | "Failed");
    let is_mirror = pod.annotations().contains_key("kubernetes.io/config.mirror");
    !host_network && !terminal && !is_mirror
}

fn resolve_subnet<'a>(
    subnets: &'a [Subnet],
    pod_annotations: &BTreeMap<String, String>,
    namespace: &str,
) -> Option<&'a Subnet> {
    let active = |s: &&Subnet| {
        s.status
            .as_ref()
            .map(|st| matches!(st.phase, SubnetPhase::Active))
            .unwrap_or(false)
    };

    if let Some(requested) = pod_annotations.get(SUBNET_REQUEST_ANNOTATION) {
        if let Some(s) = subnets.iter().find(|s| s.name() == requested).filter(active) {
            return Some(s);
        }
    }
    if let Some(s) = subnets
        .iter()
        .filter(active)
        .find(|s| s.spec.namespaces.iter().any(|ns| ns == namespace))
    {
        return Some(s);
    }
    if let Some(s) = subnets.iter().filter(active).find(|s| s.spec.default) {
        return Some(s);
    }
    subnets.iter().find(active)
}

async fn ensure_finalizer(api: &Api<Pod>, pod: &Pod) -> Result<(), ReconcileError> {
    if pod.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let patch = serde_json::json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(&pod.name_any(), &PatchParams::apply("pod-controller"), &Patch::Merge(patch))
        .await
        .map_err(|e| ReconcileError::requeue(format!("adding finalizer: {e}"), Duration::from_secs(5)))?;
    Ok(())
}

async fn remove_finalizer(api: &Api<Pod>, pod: &Pod) -> Result<(), ReconcileError> {
    let remaining: Vec<_> = pod.finalizers().iter().filter(|f| f.as_str() != FINALIZER).collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
    api.patch(&pod.name_any(), &PatchParams::apply("pod-controller"), &Patch::Merge(patch))
        .await
        .map_err(|e| ReconcileError::requeue(format!("removing finalizer: {e}"), Duration::from_secs(5)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::core::ObjectMeta;

    fn pod(host_network: bool, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("nginx".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                ..Default::default()
            }),
            status: phase.map(|p| PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn host_network_pods_are_unmanaged() {
        assert!(!is_managed(&pod(true, Some("Running"))));
    }

    #[test]
    fn terminal_pods_are_unmanaged() {
        assert!(!is_managed(&pod(false, Some("Succeeded"))));
        assert!(!is_managed(&pod(false, Some("Failed"))));
    }

    #[test]
    fn running_pod_is_managed() {
        assert!(is_managed(&pod(false, Some("Running"))));
    }

    fn active_subnet(name: &str, default: bool, namespaces: Vec<&str>) -> Subnet {
        Subnet {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: crate::model::subnet::SubnetSpec {
                cidr: "10.244.1.0/24".into(),
                gateway: "10.244.1.1".into(),
                default,
                namespaces: namespaces.into_iter().map(String::from).collect(),
                ..Default::default()
            },
            status: Some(crate::model::subnet::SubnetStatus {
                phase: SubnetPhase::Active,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn resolves_explicit_annotation_first() {
        let subnets = vec![active_subnet("a", true, vec![]), active_subnet("b", false, vec![])];
        let mut annotations = BTreeMap::new();
        annotations.insert(SUBNET_REQUEST_ANNOTATION.to_string(), "b".to_string());
        let resolved = resolve_subnet(&subnets, &annotations, "default").unwrap();
        assert_eq!(resolved.name(), "b");
    }

    #[test]
    fn resolves_namespace_match_before_default() {
        let subnets = vec![active_subnet("a", true, vec![]), active_subnet("b", false, vec!["default"])];
        let resolved = resolve_subnet(&subnets, &BTreeMap::new(), "default").unwrap();
        assert_eq!(resolved.name(), "b");
    }

    #[test]
    fn falls_back_to_default_subnet() {
        let subnets = vec![active_subnet("a", true, vec![])];
        let resolved = resolve_subnet(&subnets, &BTreeMap::new(), "other-ns").unwrap();
        assert_eq!(resolved.name(), "a");
    }

    #[test]
    fn falls_back_to_any_active_subnet() {
        let subnets = vec![active_subnet("a", false, vec![])];
        let resolved = resolve_subnet(&subnets, &BTreeMap::new(), "other-ns").unwrap();
        assert_eq!(resolved.name(), "a");
    }

    #[test]
    fn no_active_subnet_resolves_to_none() {
        assert!(resolve_subnet(&[], &BTreeMap::new(), "default").is_none());
    }
}
