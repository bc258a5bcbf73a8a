//! Maintains one persistent session to the northbound DB: a background
//! health-check task, reconnection with exponential backoff, and a typed
//! CRUD + transaction surface over the [`NbBackend`] boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::OvnError;
use crate::metrics::Metrics;

use super::backend::NbBackend;
use super::model::{Acl, LoadBalancer, LogicalSwitch, LogicalSwitchPort};
use super::ops::TxnOutcome;
use super::txn::Transaction;

#[derive(Clone, Debug)]
pub struct NbClientConfig {
    pub addresses: Vec<String>,
    pub health_check_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub transaction_timeout: Duration,
}

impl Default for NbClientConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["tcp:127.0.0.1:6641".to_string()],
            health_check_interval: Duration::from_secs(30),
            max_reconnect_attempts: 0,
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

/// Parses the comma-separated `{tcp|ssl|unix}:host:port` address syntax.
/// Rejects malformed entries so bad config fails fast at startup.
pub fn parse_addresses(raw: &str) -> Result<Vec<String>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let scheme = parts.next().unwrap_or_default();
            let host = parts.next().unwrap_or_default();
            let port = parts.next().unwrap_or_default();
            if !["tcp", "ssl", "unix"].contains(&scheme) || host.is_empty() || port.is_empty() {
                return Err(format!("invalid ovn nb address '{entry}'"));
            }
            Ok(entry.to_string())
        })
        .collect()
}

fn reconnect_backoff() -> impl Backoff + Send + Sync {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        randomization_factor: 0.2,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

pub struct NbClient {
    backend: Arc<dyn NbBackend>,
    config: NbClientConfig,
    metrics: Arc<Metrics>,
    connected: Arc<AtomicBool>,
}

impl NbClient {
    pub fn new(backend: Arc<dyn NbBackend>, config: NbClientConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            config,
            metrics,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Hands out a clone of the underlying backend handle, e.g. so the
    /// compatibility layer can classify rows directly.
    pub fn backend_handle(&self) -> Arc<dyn NbBackend> {
        self.backend.clone()
    }

    /// Polls liveness every `health_check_interval`; on failure, drives a
    /// 1s→60s exponential reconnect loop capped by `max_reconnect_attempts`
    /// (0 = unlimited). Runs until `cancel` fires.
    pub async fn run_health_check(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ovn health check loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
            }

            if self.backend.is_alive().await {
                if !self.connected.swap(true, Ordering::Relaxed) {
                    info!("ovn nb db connection restored");
                }
                self.metrics.set_ovn_connection_status("nb", true);
                continue;
            }

            self.connected.store(false, Ordering::Relaxed);
            self.metrics.set_ovn_connection_status("nb", false);
            warn!("ovn nb db health check failed; reconnecting");
            self.reconnect(&cancel).await;
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) {
        let mut backoff = reconnect_backoff();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if self.config.max_reconnect_attempts > 0 && attempt > self.config.max_reconnect_attempts {
                error!("giving up reconnecting to ovn nb db after {attempt} attempts");
                self.metrics.inc_ovn_reconnect("nb", "gave_up");
                return;
            }
            let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if self.backend.is_alive().await {
                self.connected.store(true, Ordering::Relaxed);
                self.metrics.set_ovn_connection_status("nb", true);
                self.metrics.inc_ovn_reconnect("nb", "success");
                info!("reconnected to ovn nb db after {attempt} attempts");
                return;
            }
            debug!("reconnect attempt {attempt} failed");
        }
    }

    pub async fn get_switch(&self, name: &str) -> Option<LogicalSwitch> {
        self.backend.get_switch(name).await
    }

    pub async fn list_switches(&self) -> Vec<LogicalSwitch> {
        self.backend.list_switches().await
    }

    pub async fn get_port(&self, name: &str) -> Option<LogicalSwitchPort> {
        self.backend.get_port(name).await
    }

    pub async fn list_ports(&self) -> Vec<LogicalSwitchPort> {
        self.backend.list_ports().await
    }

    pub async fn get_lb(&self, name: &str) -> Option<LoadBalancer> {
        self.backend.get_lb(name).await
    }

    pub async fn list_lbs(&self) -> Vec<LoadBalancer> {
        self.backend.list_lbs().await
    }

    pub async fn list_lbs_by_external_id(&self, key: &str, value: &str) -> Vec<LoadBalancer> {
        self.backend.list_lbs_by_external_id(key, value).await
    }

    pub async fn list_acls_by_external_id(&self, key: &str, value: &str) -> Vec<Acl> {
        self.backend.list_acls_by_external_id(key, value).await
    }

    /// Commits a transaction. Retries only on `NotConnected`, polling every
    /// 200ms until the backend reports alive again or `cancel` fires; any
    /// other error is returned to the caller unchanged.
    pub async fn commit(&self, operation: &str, txn: Transaction, cancel: &CancellationToken) -> Result<TxnOutcome, OvnError> {
        if txn.is_empty() {
            return Ok(TxnOutcome::default());
        }
        let ops = txn.into_ops();
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.transaction_timeout, async {
            loop {
                match self.backend.commit(ops.clone()).await {
                    Err(e) if e.is_not_connected() => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(e),
                            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        }
                    }
                    other => return other,
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(OvnError::TransactionError {
                operation: operation.to_string(),
                cause: "transaction timed out".to_string(),
            })
        });
        self.metrics
            .observe_ovn_operation(operation, started.elapsed(), result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_addresses() {
        let addrs = parse_addresses("tcp:10.0.0.1:6641,ssl:10.0.0.2:6641").unwrap();
        assert_eq!(addrs, vec!["tcp:10.0.0.1:6641", "ssl:10.0.0.2:6641"]);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_addresses("http:10.0.0.1:6641").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_addresses("tcp:10.0.0.1").is_err());
    }

    #[tokio::test]
    async fn commit_empty_transaction_is_noop() {
        let backend: Arc<dyn NbBackend> = Arc::new(super::super::backend::MemoryNbBackend::new());
        let client = NbClient::new(backend, NbClientConfig::default(), Arc::new(Metrics::new_for_test()));
        let cancel = CancellationToken::new();
        let outcome = client.commit("noop", Transaction::new(), &cancel).await.unwrap();
        assert!(outcome.named_uuids.is_empty());
    }

    #[tokio::test]
    async fn commit_surfaces_non_connection_errors_immediately() {
        let backend: Arc<dyn NbBackend> = Arc::new(super::super::backend::MemoryNbBackend::new());
        let client = NbClient::new(backend, NbClientConfig::default(), Arc::new(Metrics::new_for_test()));
        let cancel = CancellationToken::new();
        let mut txn = Transaction::new();
        txn.mutate_switch_add_ports("missing", vec![super::super::ops::UuidRef::Real("x".into())]);
        let err = client.commit("attach-port", txn, &cancel).await.unwrap_err();
        assert!(matches!(err, OvnError::ObjectNotFound { .. }));
    }
}
