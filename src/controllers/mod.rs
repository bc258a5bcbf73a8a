//! The four reconcilers, each a bespoke work-queue + worker-pool rather
//! than `kube::runtime::controller::Controller`: `Subnet` allocates an OVN
//! logical switch and a bitmap IP pool, `Pod` hands out an address from it,
//! `Service` programs Load_Balancer rows, `NetworkPolicy` programs ACLs.

pub mod backoff_tracker;
pub mod networkpolicy;
pub mod pod;
pub mod service;
pub mod subnet;
pub mod workqueue;

pub use networkpolicy::NetworkPolicyController;
pub use pod::PodController;
pub use service::ServiceController;
pub use subnet::SubnetController;
