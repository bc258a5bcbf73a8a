//! The boundary between this system and the OVSDB wire protocol itself,
//! which is assumed provided by a library and is not reimplemented here.
//! [`MemoryNbBackend`] stands in for that library in tests, the same way
//! the teacher's `Backend` trait separated rule application from the shell
//! commands that actually ran iptables.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::OvnError;

use super::model::{Acl, LoadBalancer, LogicalSwitch, LogicalSwitchPort};
use super::ops::{Kind, TxnOp, TxnOutcome, UuidRef};

#[async_trait]
pub trait NbBackend: Send + Sync {
    async fn is_alive(&self) -> bool;

    async fn get_switch(&self, name: &str) -> Option<LogicalSwitch>;
    async fn list_switches(&self) -> Vec<LogicalSwitch>;

    async fn get_port(&self, name: &str) -> Option<LogicalSwitchPort>;
    async fn list_ports(&self) -> Vec<LogicalSwitchPort>;

    async fn get_lb(&self, name: &str) -> Option<LoadBalancer>;
    async fn list_lbs(&self) -> Vec<LoadBalancer>;
    async fn list_lbs_by_external_id(&self, key: &str, value: &str) -> Vec<LoadBalancer>;

    async fn list_acls_by_external_id(&self, key: &str, value: &str) -> Vec<Acl>;

    /// Commits every op in one OVSDB transaction. Implementations MUST be
    /// atomic: either every op applies or none does.
    async fn commit(&self, ops: Vec<TxnOp>) -> Result<TxnOutcome, OvnError>;
}

#[derive(Default, Clone)]
struct MemoryState {
    switches: BTreeMap<String, LogicalSwitch>,
    ports: BTreeMap<String, LogicalSwitchPort>,
    lbs: BTreeMap<String, LoadBalancer>,
    acls: BTreeMap<String, Acl>,
    alive: bool,
    uuid_seq: u64,
}

/// An in-memory Northbound DB used by tests and by integration setups that
/// don't have a live `ovsdb-server` to talk to.
pub struct MemoryNbBackend {
    state: RwLock<MemoryState>,
}

impl Default for MemoryNbBackend {
    fn default() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                alive: true,
                ..Default::default()
            }),
        }
    }
}

impl MemoryNbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, alive: bool) {
        self.state.write().alive = alive;
    }

    fn next_uuid(state: &mut MemoryState, prefix: &str) -> String {
        state.uuid_seq += 1;
        format!("{prefix}-uuid-{}", state.uuid_seq)
    }

    fn resolve<'a>(resolved: &'a BTreeMap<String, String>, r: &'a UuidRef) -> &'a str {
        match r {
            UuidRef::Named(n) => resolved.get(n).map(String::as_str).unwrap_or(n.as_str()),
            UuidRef::Real(u) => u.as_str(),
        }
    }
}

#[async_trait]
impl NbBackend for MemoryNbBackend {
    async fn is_alive(&self) -> bool {
        self.state.read().alive
    }

    async fn get_switch(&self, name: &str) -> Option<LogicalSwitch> {
        self.state.read().switches.get(name).cloned()
    }

    async fn list_switches(&self) -> Vec<LogicalSwitch> {
        self.state.read().switches.values().cloned().collect()
    }

    async fn get_port(&self, name: &str) -> Option<LogicalSwitchPort> {
        self.state.read().ports.get(name).cloned()
    }

    async fn list_ports(&self) -> Vec<LogicalSwitchPort> {
        self.state.read().ports.values().cloned().collect()
    }

    async fn get_lb(&self, name: &str) -> Option<LoadBalancer> {
        self.state.read().lbs.get(name).cloned()
    }

    async fn list_lbs(&self) -> Vec<LoadBalancer> {
        self.state.read().lbs.values().cloned().collect()
    }

    async fn list_lbs_by_external_id(&self, key: &str, value: &str) -> Vec<LoadBalancer> {
        self.state
            .read()
            .lbs
            .values()
            .filter(|lb| lb.external_ids.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect()
    }

    async fn list_acls_by_external_id(&self, key: &str, value: &str) -> Vec<Acl> {
        self.state
            .read()
            .acls
            .values()
            .filter(|acl| acl.external_ids.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect()
    }

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<TxnOutcome, OvnError> {
        // Stage every op against a private clone of the DB state. Only once
        // the whole batch has applied cleanly do we swap it into the real
        // lock, so a failing op partway through never leaves earlier ops in
        // this same transaction visible — matching the "all ops apply, or
        // none do" contract `NbBackend::commit` promises.
        let mut state = {
            let current = self.state.read();
            if !current.alive {
                return Err(OvnError::ConnectionError {
                    address: "memory".into(),
                    cause: "not connected".into(),
                    retries: 0,
                });
            }
            current.clone()
        };
        let mut outcome = TxnOutcome::default();
        for op in &ops {
            match op {
                TxnOp::InsertSwitch { named_uuid, row } => {
                    let uuid = Self::next_uuid(&mut state, "ls");
                    outcome.named_uuids.insert(named_uuid.clone(), uuid.clone());
                    let mut row = row.clone();
                    row.uuid = uuid;
                    state.switches.insert(row.name.clone(), row);
                }
                TxnOp::InsertPort { named_uuid, row } => {
                    let uuid = Self::next_uuid(&mut state, "lsp");
                    outcome.named_uuids.insert(named_uuid.clone(), uuid.clone());
                    let mut row = row.clone();
                    row.uuid = uuid;
                    state.ports.insert(row.name.clone(), row);
                }
                TxnOp::InsertLb { named_uuid, row } => {
                    let uuid = Self::next_uuid(&mut state, "lb");
                    outcome.named_uuids.insert(named_uuid.clone(), uuid.clone());
                    let mut row = row.clone();
                    row.uuid = uuid;
                    state.lbs.insert(row.name.clone(), row);
                }
                TxnOp::InsertAcl { named_uuid, row } => {
                    let uuid = Self::next_uuid(&mut state, "acl");
                    outcome.named_uuids.insert(named_uuid.clone(), uuid.clone());
                    let mut row = row.clone();
                    row.uuid = uuid.clone();
                    state.acls.insert(uuid, row);
                }
                TxnOp::UpdateSwitchOtherConfig { name, other_config } => {
                    if let Some(sw) = state.switches.get_mut(name) {
                        sw.other_config = other_config.clone();
                    } else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: name.clone(),
                        });
                    }
                }
                TxnOp::UpdateLbVips { name, vips } => {
                    if let Some(lb) = state.lbs.get_mut(name) {
                        lb.vips = vips.clone();
                    } else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LoadBalancer.as_str(),
                            name: name.clone(),
                        });
                    }
                }
                TxnOp::UpdateLbOptions { name, options } => {
                    if let Some(lb) = state.lbs.get_mut(name) {
                        lb.options = options.clone();
                    } else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LoadBalancer.as_str(),
                            name: name.clone(),
                        });
                    }
                }
                TxnOp::MutateSwitchAddPorts { switch, ports } => {
                    let resolved = outcome.named_uuids.clone();
                    let Some(sw) = state.switches.get_mut(switch) else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: switch.clone(),
                        });
                    };
                    for p in ports {
                        let uuid = Self::resolve(&resolved, p).to_string();
                        if !sw.ports.contains(&uuid) {
                            sw.ports.push(uuid);
                        }
                    }
                }
                TxnOp::MutateSwitchDeletePorts { switch, ports } => {
                    let resolved = outcome.named_uuids.clone();
                    let Some(sw) = state.switches.get_mut(switch) else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: switch.clone(),
                        });
                    };
                    for p in ports {
                        let uuid = Self::resolve(&resolved, p).to_string();
                        sw.ports.retain(|u| u != &uuid);
                    }
                }
                TxnOp::MutateSwitchAddAcls { switch, acls } => {
                    let resolved = outcome.named_uuids.clone();
                    let Some(sw) = state.switches.get_mut(switch) else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: switch.clone(),
                        });
                    };
                    for a in acls {
                        let uuid = Self::resolve(&resolved, a).to_string();
                        if !sw.acls.contains(&uuid) {
                            sw.acls.push(uuid);
                        }
                    }
                }
                TxnOp::MutateSwitchDeleteAcls { switch, acls } => {
                    let resolved = outcome.named_uuids.clone();
                    let Some(sw) = state.switches.get_mut(switch) else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: switch.clone(),
                        });
                    };
                    for a in acls {
                        let uuid = Self::resolve(&resolved, a).to_string();
                        sw.acls.retain(|u| u != &uuid);
                    }
                }
                TxnOp::MutateSwitchAddLbs { switch, lbs } => {
                    let resolved = outcome.named_uuids.clone();
                    let Some(sw) = state.switches.get_mut(switch) else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: switch.clone(),
                        });
                    };
                    for l in lbs {
                        let uuid = Self::resolve(&resolved, l).to_string();
                        if !sw.load_balancer.contains(&uuid) {
                            sw.load_balancer.push(uuid);
                        }
                    }
                }
                TxnOp::MutateSwitchDeleteLbs { switch, lbs } => {
                    let resolved = outcome.named_uuids.clone();
                    let Some(sw) = state.switches.get_mut(switch) else {
                        return Err(OvnError::ObjectNotFound {
                            kind: Kind::LogicalSwitch.as_str(),
                            name: switch.clone(),
                        });
                    };
                    for l in lbs {
                        let uuid = Self::resolve(&resolved, l).to_string();
                        sw.load_balancer.retain(|u| u != &uuid);
                    }
                }
                TxnOp::DeleteRow { kind, name } => match kind {
                    Kind::LogicalSwitch => {
                        state.switches.remove(name);
                    }
                    Kind::LogicalSwitchPort => {
                        state.ports.remove(name);
                    }
                    Kind::LoadBalancer => {
                        state.lbs.remove(name);
                    }
                    Kind::Acl => {
                        state.acls.remove(name);
                    }
                },
            }
        }
        *self.state.write() = state;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::model::our_marker;
    use crate::ovn::txn::Transaction;

    #[tokio::test]
    async fn insert_switch_then_get() {
        let backend = MemoryNbBackend::new();
        let mut txn = Transaction::new();
        txn.insert_switch(LogicalSwitch {
            name: "subnet-s1".into(),
            external_ids: our_marker(),
            ..Default::default()
        });
        backend.commit(txn.into_ops()).await.unwrap();
        let sw = backend.get_switch("subnet-s1").await.unwrap();
        assert_eq!(sw.name, "subnet-s1");
        assert!(!sw.uuid.is_empty());
    }

    #[tokio::test]
    async fn insert_port_and_attach_is_atomic() {
        let backend = MemoryNbBackend::new();
        let mut txn = Transaction::new();
        txn.insert_switch(LogicalSwitch {
            name: "subnet-s1".into(),
            ..Default::default()
        });
        let port_ref = txn.insert_port(LogicalSwitchPort {
            name: "default_nginx".into(),
            ..Default::default()
        });
        txn.mutate_switch_add_ports("subnet-s1", vec![port_ref]);
        backend.commit(txn.into_ops()).await.unwrap();
        let sw = backend.get_switch("subnet-s1").await.unwrap();
        assert_eq!(sw.ports.len(), 1);
        let port = backend.get_port("default_nginx").await.unwrap();
        assert_eq!(sw.ports[0], port.uuid);
    }

    #[tokio::test]
    async fn commit_fails_fast_when_not_alive() {
        let backend = MemoryNbBackend::new();
        backend.set_alive(false);
        let mut txn = Transaction::new();
        txn.insert_switch(LogicalSwitch::default());
        let err = backend.commit(txn.into_ops()).await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn mutate_on_missing_switch_fails() {
        let backend = MemoryNbBackend::new();
        let mut txn = Transaction::new();
        let port_ref = txn.insert_port(LogicalSwitchPort::default());
        txn.mutate_switch_add_ports("nonexistent", vec![port_ref]);
        assert!(backend.commit(txn.into_ops()).await.is_err());

        // the failing mutate op must roll back the insert_port that
        // preceded it in the same transaction: nothing partially applies.
        assert!(backend.list_ports().await.is_empty());
        assert!(backend.list_switches().await.is_empty());
    }
}
