use std::time::Duration;

use thiserror::Error;

/// Errors raised by the bitmap-backed per-subnet IP pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("subnet '{subnet}' has no free addresses left")]
    SubnetExhausted { subnet: String },

    #[error("ip {ip} is already allocated")]
    IpAlreadyAllocated { ip: String },

    #[error("ip {ip} is not within subnet '{subnet}'")]
    IpOutOfRange { ip: String, subnet: String },

    #[error("ip {ip} is excluded from the pool and cannot be released")]
    ExcludedIpRelease { ip: String },

    #[error("cidr '{cidr}' leaves no usable host addresses")]
    DegenerateCidr { cidr: String },
}

/// Errors raised by the OVN northbound database facade.
#[derive(Error, Debug, Clone)]
pub enum OvnError {
    #[error("failed to connect to ovn nb db at {address}: {cause} (retries: {retries})")]
    ConnectionError {
        address: String,
        cause: String,
        retries: u32,
    },

    #[error("transaction failed during '{operation}': {cause}")]
    TransactionError { operation: String, cause: String },

    #[error("{kind} '{name}' not found")]
    ObjectNotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    ObjectExists { kind: &'static str, name: String },

    #[error("invalid {field} = '{value}': {message}")]
    ValidationError {
        field: &'static str,
        value: String,
        message: String,
    },

    #[error("{kind} '{name}' conflicts with an existing writer: {reason}")]
    Conflict {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

impl OvnError {
    /// `NotConnected` is the only transaction-level error the client facade
    /// retries on its own; everything else is returned to the caller.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, OvnError::ConnectionError { .. })
    }
}

/// Errors bubbled up from a single reconcile() call on a controller.
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Ovn(#[from] OvnError),

    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("requeue after {after:?}: {reason}")]
    Requeue { after: Duration, reason: String },

    #[error("{0}")]
    Terminal(String),
}

impl ReconcileError {
    pub fn requeue(reason: impl Into<String>, after: Duration) -> Self {
        ReconcileError::Requeue {
            after,
            reason: reason.into(),
        }
    }

    /// Whether the controller's work queue should re-enqueue this key with
    /// backoff, as opposed to leaving it parked until the spec changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReconcileError::Ovn(OvnError::ConnectionError { .. })
                | ReconcileError::Ovn(OvnError::TransactionError { .. })
                | ReconcileError::Requeue { .. }
        )
    }
}
