pub mod backend;
pub mod client;
pub mod compat;
pub mod model;
pub mod ops;
pub mod txn;

pub use backend::{MemoryNbBackend, NbBackend};
pub use client::{parse_addresses, NbClient, NbClientConfig};
pub use compat::CompatLayer;
