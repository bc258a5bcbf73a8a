//! Transaction composition: instead of imperative "do A then B" chains,
//! cross-row changes are expressed as a builder that produces a vector of
//! operations submitted atomically. Controllers never need to undo
//! partial work because there is no partial work to undo.

use std::collections::BTreeMap;

use super::model::{Acl, LoadBalancer, LogicalSwitch, LogicalSwitchPort};
use super::ops::{Kind, TxnOp, UuidRef};

#[derive(Default)]
pub struct Transaction {
    ops: Vec<TxnOp>,
    next_named_uuid: u64,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<TxnOp> {
        self.ops
    }

    /// Allocates a fresh `named-uuid-<prefix>-<n>` for cross-referencing a
    /// row inserted earlier in this same transaction.
    pub fn fresh_named_uuid(&mut self, prefix: &str) -> String {
        let id = self.next_named_uuid;
        self.next_named_uuid += 1;
        format!("named-uuid-{prefix}-{id}")
    }

    pub fn insert_switch(&mut self, row: LogicalSwitch) -> UuidRef {
        let named_uuid = self.fresh_named_uuid("ls");
        self.ops.push(TxnOp::InsertSwitch {
            named_uuid: named_uuid.clone(),
            row,
        });
        UuidRef::Named(named_uuid)
    }

    pub fn insert_port(&mut self, row: LogicalSwitchPort) -> UuidRef {
        let named_uuid = self.fresh_named_uuid("lsp");
        self.ops.push(TxnOp::InsertPort {
            named_uuid: named_uuid.clone(),
            row,
        });
        UuidRef::Named(named_uuid)
    }

    pub fn insert_lb(&mut self, row: LoadBalancer) -> UuidRef {
        let named_uuid = self.fresh_named_uuid("lb");
        self.ops.push(TxnOp::InsertLb {
            named_uuid: named_uuid.clone(),
            row,
        });
        UuidRef::Named(named_uuid)
    }

    pub fn insert_acl(&mut self, row: Acl) -> UuidRef {
        let named_uuid = self.fresh_named_uuid("acl");
        self.ops.push(TxnOp::InsertAcl {
            named_uuid: named_uuid.clone(),
            row,
        });
        UuidRef::Named(named_uuid)
    }

    pub fn update_switch_other_config(
        &mut self,
        switch: impl Into<String>,
        other_config: BTreeMap<String, String>,
    ) -> &mut Self {
        self.ops.push(TxnOp::UpdateSwitchOtherConfig {
            name: switch.into(),
            other_config,
        });
        self
    }

    pub fn update_lb_vips(
        &mut self,
        lb: impl Into<String>,
        vips: BTreeMap<String, String>,
    ) -> &mut Self {
        self.ops.push(TxnOp::UpdateLbVips { name: lb.into(), vips });
        self
    }

    pub fn update_lb_options(
        &mut self,
        lb: impl Into<String>,
        options: BTreeMap<String, String>,
    ) -> &mut Self {
        self.ops
            .push(TxnOp::UpdateLbOptions { name: lb.into(), options });
        self
    }

    pub fn mutate_switch_add_ports(&mut self, switch: impl Into<String>, ports: Vec<UuidRef>) -> &mut Self {
        if !ports.is_empty() {
            self.ops.push(TxnOp::MutateSwitchAddPorts {
                switch: switch.into(),
                ports,
            });
        }
        self
    }

    pub fn mutate_switch_delete_ports(
        &mut self,
        switch: impl Into<String>,
        ports: Vec<UuidRef>,
    ) -> &mut Self {
        if !ports.is_empty() {
            self.ops.push(TxnOp::MutateSwitchDeletePorts {
                switch: switch.into(),
                ports,
            });
        }
        self
    }

    pub fn mutate_switch_add_acls(&mut self, switch: impl Into<String>, acls: Vec<UuidRef>) -> &mut Self {
        if !acls.is_empty() {
            self.ops.push(TxnOp::MutateSwitchAddAcls {
                switch: switch.into(),
                acls,
            });
        }
        self
    }

    pub fn mutate_switch_delete_acls(
        &mut self,
        switch: impl Into<String>,
        acls: Vec<UuidRef>,
    ) -> &mut Self {
        if !acls.is_empty() {
            self.ops.push(TxnOp::MutateSwitchDeleteAcls {
                switch: switch.into(),
                acls,
            });
        }
        self
    }

    pub fn mutate_switch_add_lbs(&mut self, switch: impl Into<String>, lbs: Vec<UuidRef>) -> &mut Self {
        if !lbs.is_empty() {
            self.ops.push(TxnOp::MutateSwitchAddLbs {
                switch: switch.into(),
                lbs,
            });
        }
        self
    }

    pub fn mutate_switch_delete_lbs(&mut self, switch: impl Into<String>, lbs: Vec<UuidRef>) -> &mut Self {
        if !lbs.is_empty() {
            self.ops.push(TxnOp::MutateSwitchDeleteLbs {
                switch: switch.into(),
                lbs,
            });
        }
        self
    }

    pub fn delete_row(&mut self, kind: Kind, name: impl Into<String>) -> &mut Self {
        self.ops.push(TxnOp::DeleteRow {
            kind,
            name: name.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::model::LogicalSwitchPort;

    #[test]
    fn insert_port_and_mutate_switch_is_one_atomic_op_list() {
        let mut txn = Transaction::new();
        let port_ref = txn.insert_port(LogicalSwitchPort {
            name: "default_nginx".into(),
            ..Default::default()
        });
        txn.mutate_switch_add_ports("subnet-default", vec![port_ref]);
        let ops = txn.into_ops();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], TxnOp::InsertPort { .. }));
        assert!(matches!(ops[1], TxnOp::MutateSwitchAddPorts { .. }));
    }

    #[test]
    fn named_uuids_are_unique_within_a_transaction() {
        let mut txn = Transaction::new();
        let a = txn.fresh_named_uuid("lsp");
        let b = txn.fresh_named_uuid("lsp");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_mutations_are_elided() {
        let mut txn = Transaction::new();
        txn.mutate_switch_add_ports("subnet-default", vec![]);
        assert!(txn.is_empty());
    }
}
