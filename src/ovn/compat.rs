//! Gates every create/delete against the possibility that a pre-existing
//! tenant writer ("ZStack") already owns the row. Classification never
//! silently adopts a row we didn't create.

use std::sync::Arc;

use crate::error::OvnError;

use super::backend::NbBackend;
use super::model::{classify, LogicalSwitch, Ownership};
use super::txn::Transaction;

pub struct CompatLayer {
    backend: Arc<dyn NbBackend>,
}

impl CompatLayer {
    pub fn new(backend: Arc<dyn NbBackend>) -> Self {
        Self { backend }
    }

    /// If the switch doesn't exist, insert it with our marker. If it exists
    /// and is ours, update `other_config`. Tenant-managed or unmanaged rows
    /// are a `Conflict` — we never take over a row we didn't create.
    pub async fn safe_create_switch(&self, row: LogicalSwitch) -> Result<(), OvnError> {
        match self.backend.get_switch(&row.name).await {
            None => {
                let mut txn = Transaction::new();
                txn.insert_switch(row);
                self.backend.commit(txn.into_ops()).await?;
                Ok(())
            }
            Some(existing) => match classify(&existing.external_ids) {
                Ownership::Ours => {
                    let mut txn = Transaction::new();
                    txn.update_switch_other_config(row.name.clone(), row.other_config.clone());
                    self.backend.commit(txn.into_ops()).await?;
                    Ok(())
                }
                Ownership::TenantManaged | Ownership::Unmanaged => Err(OvnError::Conflict {
                    kind: "Logical_Switch",
                    name: row.name,
                    reason: format!("row already owned by {:?}", classify(&existing.external_ids)),
                }),
            },
        }
    }

    /// Missing is a no-op; ours is deleted; anything else is a `Conflict`.
    pub async fn safe_delete_switch(&self, name: &str) -> Result<(), OvnError> {
        match self.backend.get_switch(name).await {
            None => Ok(()),
            Some(existing) => match classify(&existing.external_ids) {
                Ownership::Ours => {
                    let mut txn = Transaction::new();
                    txn.delete_row(super::ops::Kind::LogicalSwitch, name);
                    self.backend.commit(txn.into_ops()).await?;
                    Ok(())
                }
                other => Err(OvnError::Conflict {
                    kind: "Logical_Switch",
                    name: name.to_string(),
                    reason: format!("refusing to delete a row owned by {other:?}"),
                }),
            },
        }
    }

    /// Used when a Subnet is in external mode: we never create, only
    /// reference. Succeeds regardless of ownership marker as long as the
    /// row exists.
    pub async fn validate_external_reference(&self, name: &str) -> Result<(), OvnError> {
        match self.backend.get_switch(name).await {
            Some(_) => Ok(()),
            None => Err(OvnError::ObjectNotFound {
                kind: "Logical_Switch",
                name: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::backend::MemoryNbBackend;
    use crate::ovn::model::our_marker;

    fn compat() -> CompatLayer {
        CompatLayer::new(Arc::new(MemoryNbBackend::new()))
    }

    #[tokio::test]
    async fn creates_when_absent() {
        let c = compat();
        c.safe_create_switch(LogicalSwitch {
            name: "subnet-s1".into(),
            external_ids: our_marker(),
            ..Default::default()
        })
        .await
        .unwrap();
        c.backend.get_switch("subnet-s1").await.unwrap();
    }

    #[tokio::test]
    async fn updates_when_ours() {
        let c = compat();
        c.safe_create_switch(LogicalSwitch {
            name: "subnet-s1".into(),
            external_ids: our_marker(),
            ..Default::default()
        })
        .await
        .unwrap();
        let mut updated = LogicalSwitch {
            name: "subnet-s1".into(),
            external_ids: our_marker(),
            ..Default::default()
        };
        updated.other_config.insert("subnet".into(), "10.244.1.0/24".into());
        c.safe_create_switch(updated).await.unwrap();
        let sw = c.backend.get_switch("subnet-s1").await.unwrap();
        assert_eq!(sw.other_config.get("subnet").unwrap(), "10.244.1.0/24");
    }

    #[tokio::test]
    async fn refuses_tenant_managed_row() {
        let backend = Arc::new(MemoryNbBackend::new());
        let mut txn = Transaction::new();
        let mut ids = std::collections::BTreeMap::new();
        ids.insert("zstack.io/vpc-uuid".to_string(), "vpc-1".to_string());
        txn.insert_switch(LogicalSwitch {
            name: "ls-zstack-flat-abc".into(),
            external_ids: ids,
            ..Default::default()
        });
        backend.commit(txn.into_ops()).await.unwrap();
        let c = CompatLayer::new(backend);
        let err = c
            .safe_create_switch(LogicalSwitch {
                name: "ls-zstack-flat-abc".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OvnError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let c = compat();
        c.safe_delete_switch("nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn validate_external_reference_requires_existing_row() {
        let c = compat();
        assert!(c.validate_external_reference("ls-zstack-flat-abc").await.is_err());
        c.safe_create_switch(LogicalSwitch {
            name: "ls-zstack-flat-abc".into(),
            external_ids: our_marker(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(c.validate_external_reference("ls-zstack-flat-abc").await.is_ok());
    }
}
