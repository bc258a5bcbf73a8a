//! Control plane that programs an OVN logical network to realize Kubernetes
//! workload connectivity: subnet allocation, pod port wiring, service load
//! balancers, and network policy ACLs, each driven by its own work queue.

pub mod allocator;
pub mod cli;
pub mod controllers;
pub mod error;
pub mod events;
pub mod logging;
pub mod mac;
pub mod match_expr;
pub mod metrics;
pub mod model;
pub mod ovn;

pub use cli::Opts;
pub use error::{AllocatorError, OvnError, ReconcileError};
pub use metrics::Metrics;
