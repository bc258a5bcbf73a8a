//! Converges a `Subnet` object to a logical switch (created or referenced)
//! plus a registered allocator, and keeps status in sync with reality.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ipnet::Ipv4Net;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::allocator::{AllocatorRegistry, SubnetAllocator};
use crate::error::{AllocatorError, OvnError, ReconcileError};
use crate::events::{EventRecorder, ObjectRef};
use crate::metrics::Metrics;
use crate::model::subnet::{ConditionStatus, ConditionType, Protocol, Subnet, SubnetCondition, SubnetPhase, FINALIZER};
use crate::ovn::model::{our_marker, LogicalSwitch};
use crate::ovn::{CompatLayer, NbClient};

use super::backoff_tracker::BackoffTracker;
use super::workqueue::WorkQueue;

pub struct SubnetController {
    pub client: Client,
    pub ovn: Arc<NbClient>,
    pub compat: CompatLayer,
    pub registry: AllocatorRegistry,
    pub metrics: Arc<Metrics>,
    pub events: Arc<dyn EventRecorder>,
    pub queue: Arc<WorkQueue<String>>,
    backoff: BackoffTracker<String>,
}

impl SubnetController {
    pub fn new(
        client: Client,
        ovn: Arc<NbClient>,
        registry: AllocatorRegistry,
        metrics: Arc<Metrics>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        let compat = CompatLayer::new(ovn.backend_handle());
        Self {
            client,
            ovn,
            compat,
            registry,
            metrics,
            events,
            queue: WorkQueue::new(),
            backoff: BackoffTracker::new(),
        }
    }

    /// One worker's run loop: pull a key, reconcile, requeue with backoff
    /// on transient failure.
    pub async fn run_worker(&self) {
        while let Some(name) = self.queue.get().await {
            let started = Instant::now();
            let result = self.reconcile_one(&name).await;
            self.metrics
                .observe_reconcile("subnet", started.elapsed(), result.is_ok());
            match result {
                Ok(()) => self.backoff.reset(&name),
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next_delay(&name);
                    warn!(subnet = %name, error = %e, ?delay, "requeueing subnet after transient error");
                    self.queue.enqueue_after(name.clone(), delay);
                }
                Err(e) => {
                    warn!(subnet = %name, error = %e, "subnet reconcile failed, not requeueing until spec changes");
                }
            }
            self.queue.done(&name);
        }
    }

    async fn reconcile_one(&self, name: &str) -> Result<(), ReconcileError> {
        let api: Api<Subnet> = Api::all(self.client.clone());
        let Some(subnet) = api.get_opt(name).await.map_err(|e| {
            ReconcileError::requeue(format!("fetching subnet {name}: {e}"), Duration::from_secs(5))
        })?
        else {
            return Ok(());
        };

        if subnet.meta().deletion_timestamp.is_some() {
            return self.handle_deletion(&api, &subnet).await;
        }
        self.handle_apply(&api, &subnet).await
    }

    async fn handle_apply(&self, api: &Api<Subnet>, subnet: &Subnet) -> Result<(), ReconcileError> {
        let name = subnet.name();
        ensure_finalizer(api, subnet).await?;

        let cidr = match validate_spec(subnet) {
            Ok(cidr) => cidr,
            Err(message) => {
                self.events.warn(
                    &ObjectRef {
                        kind: "Subnet",
                        namespace: None,
                        name,
                    },
                    "ValidationFailed",
                    &message,
                );
                patch_status(api, name, SubnetPhase::Failed, 0, 0, String::new(), &message).await?;
                return Err(ReconcileError::Validation {
                    field: "spec".into(),
                    message,
                });
            }
        };

        let switch_name = subnet.logical_switch_name();
        if subnet.is_external_mode() {
            if let Err(e) = self.compat.validate_external_reference(&switch_name).await {
                let message = e.to_string();
                patch_status(api, name, SubnetPhase::Failed, 0, 0, String::new(), &message).await?;
                return Err(self.to_reconcile_error(&e, name));
            }
        } else {
            let other_config = build_other_config(&cidr, &subnet.spec.exclude_ips);
            if let Err(e) = self
                .compat
                .safe_create_switch(LogicalSwitch {
                    name: switch_name.clone(),
                    other_config,
                    external_ids: our_marker(),
                    ..Default::default()
                })
                .await
            {
                let message = e.to_string();
                patch_status(api, name, SubnetPhase::Failed, 0, 0, String::new(), &message).await?;
                return Err(self.to_reconcile_error(&e, name));
            }
        }

        let mut exclude = subnet.spec.exclude_ips.clone();
        exclude.push(subnet.spec.gateway.clone());
        let allocator = SubnetAllocator::new(name, cidr, &exclude)?;
        self.reclaim_existing_ports(&allocator, name).await;
        let (available, used) = (allocator.available() as i64, allocator.used() as i64);
        self.registry.insert(name, Arc::new(allocator));
        self.metrics.set_allocator_gauges(name, available, used);

        patch_status(
            api,
            name,
            SubnetPhase::Active,
            available,
            used,
            switch_name,
            "",
        )
        .await?;
        info!(subnet = name, available, used, "subnet is active");
        Ok(())
    }

    async fn handle_deletion(&self, api: &Api<Subnet>, subnet: &Subnet) -> Result<(), ReconcileError> {
        let name = subnet.name();
        if !subnet.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        if !subnet.is_external_mode() {
            self.compat
                .safe_delete_switch(&subnet.logical_switch_name())
                .await
                .map_err(|e| self.to_reconcile_error(&e, name))?;
        }
        self.registry.remove(name);
        remove_finalizer(api, subnet).await?;
        info!(subnet = name, "subnet torn down");
        Ok(())
    }

    /// Rebuilds allocator state from ports the Pod controller already
    /// created, so a restart doesn't hand out an IP already in use on
    /// the wire. Best-effort: a port that no longer fits (e.g. the CIDR
    /// shrank) is logged and skipped rather than failing the reconcile.
    async fn reclaim_existing_ports(&self, allocator: &SubnetAllocator, subnet_name: &str) {
        for port in self.ovn.list_ports().await {
            if port.external_ids.get("owner").map(String::as_str) != Some(super::pod::OWNER_MARKER) {
                continue;
            }
            if port.external_ids.get("subnet").map(String::as_str) != Some(subnet_name) {
                continue;
            }
            for address in &port.addresses {
                let Some(ip) = address.split_whitespace().nth(1) else {
                    continue;
                };
                let Ok(ip) = ip.parse() else { continue };
                if let Err(e) = allocator.allocate(ip) {
                    debug!(subnet = subnet_name, port = port.name, error = %e, "could not reclaim existing port address");
                }
            }
        }
    }

    fn to_reconcile_error(&self, e: &OvnError, name: &str) -> ReconcileError {
        if let OvnError::Conflict { .. } = e {
            self.events.warn(
                &ObjectRef {
                    kind: "Subnet",
                    namespace: None,
                    name,
                },
                "Conflict",
                &e.to_string(),
            );
        }
        ReconcileError::Ovn(e.clone())
    }
}

fn validate_spec(subnet: &Subnet) -> Result<Ipv4Net, String> {
    if !matches!(subnet.spec.protocol, Protocol::IPv4) {
        return Err(format!(
            "protocol {:?} is not supported yet, only IPv4 subnets can become Active",
            subnet.spec.protocol
        ));
    }
    if subnet.spec.gateway.trim().is_empty() {
        return Err("gateway must not be empty".to_string());
    }
    let cidr: Ipv4Net = subnet
        .spec
        .cidr
        .parse()
        .map_err(|e| format!("cidr '{}' is not parseable: {e}", subnet.spec.cidr))?;
    let gateway: std::net::Ipv4Addr = subnet
        .spec
        .gateway
        .parse()
        .map_err(|e| format!("gateway '{}' is not parseable: {e}", subnet.spec.gateway))?;
    if !cidr.contains(&gateway) {
        return Err(format!("gateway {} is not within cidr {cidr}", gateway));
    }
    let mut exclude = subnet.spec.exclude_ips.clone();
    exclude.push(subnet.spec.gateway.clone());
    SubnetAllocator::new(subnet.name(), cidr, &exclude).map_err(|e: AllocatorError| e.to_string())?;
    Ok(cidr)
}

fn build_other_config(cidr: &Ipv4Net, exclude_ips: &[String]) -> BTreeMap<String, String> {
    let mut other_config = BTreeMap::new();
    other_config.insert("subnet".to_string(), cidr.to_string());
    other_config.insert("exclude_ips".to_string(), exclude_ips.join(" "));
    other_config
}

async fn ensure_finalizer(api: &Api<Subnet>, subnet: &Subnet) -> Result<(), ReconcileError> {
    if subnet.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let patch = serde_json::json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(
        subnet.name(),
        &PatchParams::apply("subnet-controller"),
        &Patch::Merge(patch),
    )
    .await
    .map_err(|e| ReconcileError::requeue(format!("adding finalizer: {e}"), Duration::from_secs(5)))?;
    Ok(())
}

async fn remove_finalizer(api: &Api<Subnet>, subnet: &Subnet) -> Result<(), ReconcileError> {
    let remaining: Vec<_> = subnet.finalizers().iter().filter(|f| f.as_str() != FINALIZER).collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
    api.patch(
        subnet.name(),
        &PatchParams::apply("subnet-controller"),
        &Patch::Merge(patch),
    )
    .await
    .map_err(|e| ReconcileError::requeue(format!("removing finalizer: {e}"), Duration::from_secs(5)))?;
    Ok(())
}

fn build_status_patch(
    phase: SubnetPhase,
    available: i64,
    used: i64,
    logical_switch: String,
    reason: &str,
    now: chrono::DateTime<Utc>,
) -> serde_json::Value {
    let ok = matches!(phase, SubnetPhase::Active);
    let condition = |type_: ConditionType, reason: String, message: String| SubnetCondition {
        type_,
        status: if ok { ConditionStatus::True } else { ConditionStatus::False },
        reason,
        message,
        last_transition_time: now,
    };
    let conditions = vec![
        condition(
            ConditionType::Ready,
            if ok { "Active".into() } else { "ValidationFailed".into() },
            reason.to_string(),
        ),
        condition(
            ConditionType::LogicalSwitchReady,
            if ok { "Synced".into() } else { "NotSynced".into() },
            logical_switch.clone(),
        ),
        condition(
            ConditionType::IPPoolReady,
            if ok { "Registered".into() } else { "Unregistered".into() },
            format!("available={available} used={used}"),
        ),
    ];
    serde_json::json!({
        "status": {
            "phase": phase,
            "availableIPs": available,
            "usedIPs": used,
            "logicalSwitch": logical_switch,
            "conditions": conditions,
            "lastUpdateTime": now,
        }
    })
}

async fn patch_status(
    api: &Api<Subnet>,
    name: &str,
    phase: SubnetPhase,
    available: i64,
    used: i64,
    logical_switch: String,
    reason: &str,
) -> Result<(), ReconcileError> {
    let status = build_status_patch(phase, available, used, logical_switch, reason, Utc::now());
    debug!(subnet = name, ?phase, "patching subnet status");
    api.patch_status(name, &PatchParams::apply("subnet-controller"), &Patch::Merge(status))
        .await
        .map_err(|e| ReconcileError::requeue(format!("patching status: {e}"), Duration::from_secs(5)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::ops::Kind;
    use kube::core::ObjectMeta;

    fn subnet(cidr: &str, gateway: &str, exclude: Vec<&str>) -> Subnet {
        Subnet {
            metadata: ObjectMeta {
                name: Some("s1".into()),
                ..Default::default()
            },
            spec: crate::model::subnet::SubnetSpec {
                cidr: cidr.into(),
                gateway: gateway.into(),
                exclude_ips: exclude.into_iter().map(String::from).collect(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn s1_scenario_available_ips_is_253() {
        let s = subnet("10.244.1.0/24", "10.244.1.1", vec![]);
        let cidr = validate_spec(&s).unwrap();
        let mut exclude = s.spec.exclude_ips.clone();
        exclude.push(s.spec.gateway.clone());
        let allocator = SubnetAllocator::new("s1", cidr, &exclude).unwrap();
        assert_eq!(allocator.available(), 253);
    }

    #[test]
    fn gateway_outside_cidr_fails_validation() {
        let s = subnet("10.244.1.0/24", "10.244.2.1", vec![]);
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn unparseable_cidr_fails_validation() {
        let s = subnet("not-a-cidr", "10.244.1.1", vec![]);
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn ipv6_protocol_fails_validation() {
        let mut s = subnet("10.244.1.0/24", "10.244.1.1", vec![]);
        s.spec.protocol = crate::model::subnet::Protocol::IPv6;
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn dual_protocol_fails_validation() {
        let mut s = subnet("10.244.1.0/24", "10.244.1.1", vec![]);
        s.spec.protocol = crate::model::subnet::Protocol::Dual;
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn ovn_conflict_produces_failed_status_patch() {
        // mirrors handle_apply's OVN-op-failure branch: a Conflict from the
        // compat layer must move the subnet to Failed, not just bubble up
        // an error with status left untouched.
        let e = OvnError::Conflict {
            kind: Kind::LogicalSwitch.as_str(),
            name: "subnet-s1".into(),
            reason: "row already owned by another tenant".into(),
        };
        let patch = build_status_patch(SubnetPhase::Failed, 0, 0, String::new(), &e.to_string(), Utc::now());
        assert_eq!(patch["status"]["phase"], serde_json::json!("Failed"));
        let reason = patch["status"]["conditions"][0]["message"].as_str().unwrap();
        assert!(reason.contains("already owned by another tenant"));
    }

    #[test]
    fn other_config_joins_excludes_with_spaces() {
        let cidr: Ipv4Net = "10.244.1.0/24".parse().unwrap();
        let oc = build_other_config(&cidr, &["10.244.1.10".to_string(), "10.244.1.11".to_string()]);
        assert_eq!(oc.get("subnet").unwrap(), "10.244.1.0/24");
        assert_eq!(oc.get("exclude_ips").unwrap(), "10.244.1.10 10.244.1.11");
    }
}
