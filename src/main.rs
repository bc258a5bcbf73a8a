use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service as CoreService};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::{watcher, watcher::Event};
use kube::{Api, Client, Resource, ResourceExt};
use prometheus::{Encoder, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use zstack_ovn_kubernetes::allocator::AllocatorRegistry;
use zstack_ovn_kubernetes::cli::Opts;
use zstack_ovn_kubernetes::controllers::workqueue::WorkQueue;
use zstack_ovn_kubernetes::controllers::{
    NetworkPolicyController, PodController, ServiceController, SubnetController,
};
use zstack_ovn_kubernetes::events::TracingEventRecorder;
use zstack_ovn_kubernetes::logging;
use zstack_ovn_kubernetes::metrics::{Metrics, REGISTRY};
use zstack_ovn_kubernetes::model::Subnet;
use zstack_ovn_kubernetes::ovn::{parse_addresses, MemoryNbBackend, NbClient, NbClientConfig};

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::initialize_logging("ZOK_LOG_LEVEL");
    logging::print_startup_string();

    let opts = Opts::parse();
    let addresses = parse_addresses(&opts.ovn_nb_address)
        .map_err(|e| anyhow::anyhow!("invalid --ovn-nb-address: {e}"))?;

    let kube_client = Client::try_default().await?;
    let metrics = Arc::new(Metrics::new(&REGISTRY)?);
    let events = Arc::new(TracingEventRecorder);

    // The OVSDB wire protocol is out of scope here; MemoryNbBackend is the
    // wired default until a real `NbBackend` implementation is plugged in.
    let backend = Arc::new(MemoryNbBackend::new());
    let ovn_config = NbClientConfig {
        addresses,
        health_check_interval: opts.health_check_interval,
        max_reconnect_attempts: opts.max_reconnect_attempts,
        transaction_timeout: opts.transaction_timeout,
    };
    let ovn = Arc::new(NbClient::new(backend, ovn_config, metrics.clone()));

    let registry = AllocatorRegistry::new();

    let subnet_controller = Arc::new(SubnetController::new(
        kube_client.clone(),
        ovn.clone(),
        registry.clone(),
        metrics.clone(),
        events.clone(),
    ));
    let pod_controller = Arc::new(PodController::new(
        kube_client.clone(),
        ovn.clone(),
        registry.clone(),
        metrics.clone(),
        events.clone(),
    ));
    let service_controller = Arc::new(ServiceController::new(
        kube_client.clone(),
        ovn.clone(),
        metrics.clone(),
        events.clone(),
    ));
    let networkpolicy_controller = Arc::new(NetworkPolicyController::new(
        kube_client.clone(),
        ovn.clone(),
        metrics.clone(),
        events.clone(),
    ));

    let cancel = CancellationToken::new();

    // Worker-pool tasks drain their queue on shutdown (`queue.shutdown()`
    // unblocks `queue.get()` once empty) and are joined, not aborted, so a
    // reconcile in flight gets to finish. Watch/health-check/metrics tasks
    // have no such drain concept and are aborted once the workers are done.
    let mut worker_tasks = Vec::new();
    let mut aux_tasks = Vec::new();

    for _ in 0..opts.workers_per_controller {
        let c = subnet_controller.clone();
        worker_tasks.push(tokio::spawn(async move { c.run_worker().await }));
        let c = pod_controller.clone();
        worker_tasks.push(tokio::spawn(async move { c.run_worker().await }));
        let c = service_controller.clone();
        worker_tasks.push(tokio::spawn(async move { c.run_worker().await }));
        let c = networkpolicy_controller.clone();
        worker_tasks.push(tokio::spawn(async move { c.run_worker().await }));
    }

    {
        let ovn = ovn.clone();
        let cancel = cancel.clone();
        aux_tasks.push(tokio::spawn(async move { ovn.run_health_check(cancel).await }));
    }

    aux_tasks.push(tokio::spawn(run_watch(
        Api::<Subnet>::all(kube_client.clone()),
        subnet_controller.queue.clone(),
        |s: &Subnet| s.name_any(),
    )));
    aux_tasks.push(tokio::spawn(run_watch(
        Api::<Pod>::all(kube_client.clone()),
        pod_controller.queue.clone(),
        |p: &Pod| format!("{}/{}", p.namespace().unwrap_or_default(), p.name_any()),
    )));
    aux_tasks.push(tokio::spawn(run_watch(
        Api::<CoreService>::all(kube_client.clone()),
        service_controller.queue.clone(),
        |s: &CoreService| format!("{}/{}", s.namespace().unwrap_or_default(), s.name_any()),
    )));
    aux_tasks.push(tokio::spawn(run_watch(
        Api::<NetworkPolicy>::all(kube_client.clone()),
        networkpolicy_controller.queue.clone(),
        |p: &NetworkPolicy| format!("{}/{}", p.namespace().unwrap_or_default(), p.name_any()),
    )));

    aux_tasks.push(tokio::spawn(serve_metrics(opts.metrics_addr, cancel.clone())));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, draining work queues");
        }
    }

    cancel.cancel();
    subnet_controller.queue.shutdown();
    pod_controller.queue.shutdown();
    service_controller.queue.shutdown();
    networkpolicy_controller.queue.shutdown();

    futures::future::join_all(worker_tasks).await;
    for task in aux_tasks {
        task.abort();
    }

    Ok(())
}

/// Feeds a work queue from a resource's watch stream. Restart events
/// re-enqueue every listed object so a missed delta during a reconnect
/// gets picked back up; the queue's own dedup collapses the rest.
async fn run_watch<T, F>(api: Api<T>, queue: Arc<WorkQueue<String>>, key_of: F)
where
    T: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    T::DynamicType: Default,
    F: Fn(&T) -> String,
{
    let mut stream = Box::pin(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(obj)) => queue.enqueue(key_of(&obj)),
            Ok(Event::Deleted(obj)) => queue.enqueue(key_of(&obj)),
            Ok(Event::Restarted(objs)) => objs.iter().for_each(|o| queue.enqueue(key_of(o))),
            Err(e) => warn!(error = %e, "watch stream error"),
        }
    }
}

async fn serve_metrics(addr: std::net::SocketAddr, cancel: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind metrics listener");
            return;
        }
    };
    info!(%addr, "serving metrics");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((mut socket, _)) = accepted else { continue };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    // discard the request line/headers, we only serve one route
                    let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;

                    let encoder = TextEncoder::new();
                    let families = REGISTRY.gather();
                    let mut body = Vec::new();
                    if encoder.encode(&families, &mut body).is_err() {
                        return;
                    }
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        encoder.format_type(),
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    }
}
