//! The operation vocabulary a [`super::txn::Transaction`] is built from.
//! Mirrors OVSDB's notion of an "operation list committed in one
//! transaction" without modelling the wire encoding itself — that's the
//! backend's job.

use super::model::{Acl, LoadBalancer, LogicalSwitch, LogicalSwitchPort};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    LogicalSwitch,
    LogicalSwitchPort,
    LoadBalancer,
    Acl,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::LogicalSwitch => "Logical_Switch",
            Kind::LogicalSwitchPort => "Logical_Switch_Port",
            Kind::LoadBalancer => "Load_Balancer",
            Kind::Acl => "ACL",
        }
    }
}

/// A reference to a row, either one already committed (by real UUID) or one
/// being inserted in the same transaction (by its `named-uuid-<key>`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UuidRef {
    Named(String),
    Real(String),
}

impl UuidRef {
    pub fn named(key: impl Into<String>) -> Self {
        UuidRef::Named(key.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    InsertSwitch {
        named_uuid: String,
        row: LogicalSwitch,
    },
    InsertPort {
        named_uuid: String,
        row: LogicalSwitchPort,
    },
    InsertLb {
        named_uuid: String,
        row: LoadBalancer,
    },
    InsertAcl {
        named_uuid: String,
        row: Acl,
    },
    UpdateSwitchOtherConfig {
        name: String,
        other_config: std::collections::BTreeMap<String, String>,
    },
    UpdateLbVips {
        name: String,
        vips: std::collections::BTreeMap<String, String>,
    },
    UpdateLbOptions {
        name: String,
        options: std::collections::BTreeMap<String, String>,
    },
    MutateSwitchAddPorts {
        switch: String,
        ports: Vec<UuidRef>,
    },
    MutateSwitchDeletePorts {
        switch: String,
        ports: Vec<UuidRef>,
    },
    MutateSwitchAddAcls {
        switch: String,
        acls: Vec<UuidRef>,
    },
    MutateSwitchDeleteAcls {
        switch: String,
        acls: Vec<UuidRef>,
    },
    MutateSwitchAddLbs {
        switch: String,
        lbs: Vec<UuidRef>,
    },
    MutateSwitchDeleteLbs {
        switch: String,
        lbs: Vec<UuidRef>,
    },
    DeleteRow {
        kind: Kind,
        name: String,
    },
}

/// Result of committing a transaction: the real UUID assigned to every
/// `named-uuid-<key>` referenced by an insert operation.
#[derive(Clone, Debug, Default)]
pub struct TxnOutcome {
    pub named_uuids: std::collections::BTreeMap<String, String>,
}

impl TxnOutcome {
    pub fn uuid_for(&self, named_uuid: &str) -> Option<&str> {
        self.named_uuids.get(named_uuid).map(String::as_str)
    }
}
