//! Watch plumbing: one watcher + reflector per kind, fanned out to
//! subscribers over broadcast channels.
//!
//! The reflector stores are the provider's cached views (the freshness rules
//! in the engine decide when they may be trusted); the broadcast side is the
//! notification stream the event filter consumes. Workload and pod watches
//! are server-side filtered down to this provider's label.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::warn;

use crate::crd::LoadBalancer;
use crate::labels;

const CHANNEL_CAPACITY: usize = 256;

/// A change notification for one object.
pub enum ObjectEvent<K> {
    Applied(Arc<K>),
    Deleted(Arc<K>),
}

impl<K> Clone for ObjectEvent<K> {
    fn clone(&self) -> Self {
        match self {
            ObjectEvent::Applied(obj) => ObjectEvent::Applied(Arc::clone(obj)),
            ObjectEvent::Deleted(obj) => ObjectEvent::Deleted(Arc::clone(obj)),
        }
    }
}

/// Shared informer handles for every kind the provider watches.
pub struct WatchHub {
    pub load_balancers: Store<LoadBalancer>,
    pub workloads: Store<Deployment>,
    pub pods: Store<Pod>,
    lb_tx: broadcast::Sender<ObjectEvent<LoadBalancer>>,
    workload_tx: broadcast::Sender<ObjectEvent<Deployment>>,
    pod_tx: broadcast::Sender<ObjectEvent<Pod>>,
}

impl WatchHub {
    /// Start watching. `namespace = None` watches the whole cluster.
    pub fn spawn(client: Client, namespace: Option<&str>) -> Self {
        let provider_selector = format!("{}={}", labels::LABEL_PROVIDER, labels::PROVIDER_NAME);

        let (load_balancers, lb_tx) = spawn_watch(
            scoped_api::<LoadBalancer>(&client, namespace),
            watcher::Config::default().any_semantic(),
        );
        let (workloads, workload_tx) = spawn_watch(
            scoped_api::<Deployment>(&client, namespace),
            watcher::Config::default().labels(&provider_selector),
        );
        let (pods, pod_tx) = spawn_watch(
            scoped_api::<Pod>(&client, namespace),
            watcher::Config::default().labels(&provider_selector),
        );

        Self {
            load_balancers,
            workloads,
            pods,
            lb_tx,
            workload_tx,
            pod_tx,
        }
    }

    pub fn load_balancer_events(&self) -> broadcast::Receiver<ObjectEvent<LoadBalancer>> {
        self.lb_tx.subscribe()
    }

    pub fn workload_events(&self) -> broadcast::Receiver<ObjectEvent<Deployment>> {
        self.workload_tx.subscribe()
    }

    pub fn pod_events(&self) -> broadcast::Receiver<ObjectEvent<Pod>> {
        self.pod_tx.subscribe()
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn spawn_watch<K>(
    api: Api<K>,
    cfg: watcher::Config,
) -> (Store<K>, broadcast::Sender<ObjectEvent<K>>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    let events = tx.clone();

    tokio::spawn(async move {
        let stream = reflector::reflector(writer, watcher(api, cfg)).default_backoff();
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    // send fails only without subscribers; nothing to do then
                    let _ = events.send(ObjectEvent::Applied(Arc::new(obj)));
                }
                Ok(watcher::Event::Delete(obj)) => {
                    let _ = events.send(ObjectEvent::Deleted(Arc::new(obj)));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "watch stream error"),
            }
        }
    });

    (reader, tx)
}
