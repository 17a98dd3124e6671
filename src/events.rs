//! Event filtering and enqueueing.
//!
//! Notifications arrive for LoadBalancers and for label-selected workloads
//! and pods. LoadBalancer events go straight to the provider's sync hook;
//! workload and pod events are dropped unless they carry this provider's
//! label, then resolved to their owning LoadBalancer, whose key is what gets
//! enqueued. Handlers do nothing heavier than an enqueue, so the delivery
//! tasks are never blocked.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::Provider;
use crate::labels;
use crate::watch::{ObjectEvent, WatchHub};

/// Spawn one handler task per watched kind.
pub fn spawn_handlers(provider: Arc<Provider>, hub: &WatchHub) -> Vec<JoinHandle<()>> {
    use kube::ResourceExt;

    let mut handlers = Vec::new();

    let mut lb_events = hub.load_balancer_events();
    let lb_provider = Arc::clone(&provider);
    handlers.push(tokio::spawn(async move {
        loop {
            match lb_events.recv().await {
                Ok(ObjectEvent::Applied(lb)) => lb_provider.on_sync(&lb),
                // deletion bypasses the responsibility filter: cleanup is
                // keyed on identity, not on the (now irrelevant) spec
                Ok(ObjectEvent::Deleted(lb)) => lb_provider.enqueue(&lb),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "lagged behind LoadBalancer events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    let mut workload_events = hub.workload_events();
    let workload_provider = Arc::clone(&provider);
    handlers.push(tokio::spawn(async move {
        loop {
            match workload_events.recv().await {
                Ok(ObjectEvent::Applied(wl)) | Ok(ObjectEvent::Deleted(wl)) => {
                    enqueue_owner(&workload_provider, wl.labels());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "lagged behind workload events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    let mut pod_events = hub.pod_events();
    let pod_provider = provider;
    handlers.push(tokio::spawn(async move {
        loop {
            match pod_events.recv().await {
                Ok(ObjectEvent::Applied(pod)) | Ok(ObjectEvent::Deleted(pod)) => {
                    enqueue_owner(&pod_provider, pod.labels());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "lagged behind pod events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    handlers
}

/// Resolve a labeled object to its owning LoadBalancer and enqueue that key.
/// Objects without this provider's label belong to someone else and are
/// dropped without a trace.
fn enqueue_owner(provider: &Provider, object_labels: &BTreeMap<String, String>) {
    if !labels::is_provider_owned(object_labels) {
        return;
    }
    let Some(created_by) = object_labels.get(labels::LABEL_CREATED_BY) else {
        return;
    };
    let Some((namespace, name)) = labels::parse_created_by(created_by) else {
        debug!(%created_by, "unparseable created-by label");
        return;
    };
    let Some(lb) = provider.load_balancer_cached(namespace, name) else {
        debug!(lb = %created_by, "owning LoadBalancer not in cache, dropping event");
        return;
    };
    provider.on_sync(&lb);
}
