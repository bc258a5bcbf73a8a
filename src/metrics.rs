//! Prometheus registration, served over HTTP by [`crate::cli`]'s metrics
//! server. Every metric name and label set here matches the external
//! interface this system promises to Prometheus scrapers.

use std::sync::LazyLock;
use std::time::Duration;

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub struct Metrics {
    pod_network_config_duration_seconds: HistogramVec,
    pod_network_config_total: IntCounterVec,
    ovn_operation_duration_seconds: HistogramVec,
    ovn_operation_total: IntCounterVec,
    ovn_db_connection_status: IntGaugeVec,
    ovn_db_reconnect_total: IntCounterVec,
    controller_reconcile_duration_seconds: HistogramVec,
    controller_reconcile_total: IntCounterVec,
    allocator_available_ips: IntGaugeVec,
    allocator_used_ips: IntGaugeVec,
    allocator_allocation_total: IntCounterVec,
    allocator_allocation_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            pod_network_config_duration_seconds: register_histogram_vec_with_registry!(
                "pod_network_config_duration_seconds",
                "Time to assign a pod its network configuration",
                &["result"],
                registry
            )?,
            pod_network_config_total: register_int_counter_vec_with_registry!(
                "pod_network_config_total",
                "Pod network configuration attempts",
                &["result"],
                registry
            )?,
            ovn_operation_duration_seconds: register_histogram_vec_with_registry!(
                "ovn_operation_duration_seconds",
                "Time to commit an OVN NB transaction",
                &["operation"],
                registry
            )?,
            ovn_operation_total: register_int_counter_vec_with_registry!(
                "ovn_operation_total",
                "OVN NB transactions by operation and result",
                &["operation", "result"],
                registry
            )?,
            ovn_db_connection_status: register_int_gauge_vec_with_registry!(
                "ovn_db_connection_status",
                "1 if connected to the named database, 0 otherwise",
                &["database"],
                registry
            )?,
            ovn_db_reconnect_total: register_int_counter_vec_with_registry!(
                "ovn_db_reconnect_total",
                "Reconnection attempts by database and result",
                &["database", "result"],
                registry
            )?,
            controller_reconcile_duration_seconds: register_histogram_vec_with_registry!(
                "controller_reconcile_duration_seconds",
                "Time spent in a single reconcile() call",
                &["controller", "result"],
                registry
            )?,
            controller_reconcile_total: register_int_counter_vec_with_registry!(
                "controller_reconcile_total",
                "Reconcile attempts by controller and result",
                &["controller", "result"],
                registry
            )?,
            allocator_available_ips: register_int_gauge_vec_with_registry!(
                "allocator_available_ips",
                "Free addresses remaining in a subnet's pool",
                &["subnet"],
                registry
            )?,
            allocator_used_ips: register_int_gauge_vec_with_registry!(
                "allocator_used_ips",
                "Allocated addresses in a subnet's pool",
                &["subnet"],
                registry
            )?,
            allocator_allocation_total: register_int_counter_vec_with_registry!(
                "allocator_allocation_total",
                "Allocation attempts by subnet and result",
                &["subnet", "result"],
                registry
            )?,
            allocator_allocation_duration_seconds: register_histogram_vec_with_registry!(
                "allocator_allocation_duration_seconds",
                "Time spent under the allocator's writer lock",
                &["subnet"],
                registry
            )?,
        })
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new(&Registry::new()).expect("metric registration in a fresh registry cannot fail")
    }

    pub fn observe_pod_network_config(&self, elapsed: Duration, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.pod_network_config_duration_seconds
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
        self.pod_network_config_total.with_label_values(&[result]).inc();
    }

    pub fn observe_ovn_operation(&self, operation: &str, elapsed: Duration, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.ovn_operation_duration_seconds
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
        self.ovn_operation_total.with_label_values(&[operation, result]).inc();
    }

    pub fn set_ovn_connection_status(&self, database: &str, connected: bool) {
        self.ovn_db_connection_status
            .with_label_values(&[database])
            .set(i64::from(connected));
    }

    pub fn inc_ovn_reconnect(&self, database: &str, result: &str) {
        self.ovn_db_reconnect_total.with_label_values(&[database, result]).inc();
    }

    pub fn observe_reconcile(&self, controller: &str, elapsed: Duration, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.controller_reconcile_duration_seconds
            .with_label_values(&[controller, result])
            .observe(elapsed.as_secs_f64());
        self.controller_reconcile_total
            .with_label_values(&[controller, result])
            .inc();
    }

    pub fn set_allocator_gauges(&self, subnet: &str, available: i64, used: i64) {
        self.allocator_available_ips.with_label_values(&[subnet]).set(available);
        self.allocator_used_ips.with_label_values(&[subnet]).set(used);
    }

    pub fn observe_allocation(&self, subnet: &str, elapsed: Duration, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.allocator_allocation_total
            .with_label_values(&[subnet, result])
            .inc();
        self.allocator_allocation_duration_seconds
            .with_label_values(&[subnet])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_named_metric_once() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.observe_pod_network_config(Duration::from_millis(5), true);
        metrics.set_ovn_connection_status("nb", true);
        metrics.set_allocator_gauges("s1", 253, 1);
        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"pod_network_config_duration_seconds".to_string()));
        assert!(names.contains(&"allocator_available_ips".to_string()));
        assert!(names.contains(&"ovn_db_connection_status".to_string()));
    }
}
