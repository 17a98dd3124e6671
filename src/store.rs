//! Object-store boundary.
//!
//! The engine talks to the cluster through two narrow traits so every
//! reconcile path can be exercised against in-memory fakes. The kube-backed
//! implementations pair a reflector [`Store`] (the informer cache) with a
//! [`Client`] for the calls that must hit the API server directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, Resource, ResourceExt};

use crate::crd::{LoadBalancer, LoadBalancerStatus};
use crate::error::Result;
use crate::labels;

/// Access to LoadBalancer objects.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Informer-backed read. May lag the API server.
    fn get_cached(&self, namespace: &str, name: &str) -> Option<Arc<LoadBalancer>>;

    /// Uncached quorum read from the API server.
    async fn get_fresh(&self, namespace: &str, name: &str) -> Result<Option<LoadBalancer>>;

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<()>;
}

/// Access to the managed workload objects.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Informer-backed list of the namespace's workloads matching every
    /// label in `selector`. Returns owned clones; cache entries are never
    /// handed out for mutation.
    fn list_cached(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<Deployment>;

    async fn create(&self, namespace: &str, workload: &Deployment) -> Result<Deployment>;

    /// Full replace. Optimistic concurrency rides on the resource version
    /// already present in the cached copy; conflicts surface as store errors.
    async fn update(&self, namespace: &str, workload: &Deployment) -> Result<Deployment>;

    /// Cascading delete with foreground propagation.
    async fn delete(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> Result<()>;

    /// Stamp a controller owner reference onto an orphaned workload.
    async fn adopt(&self, owner: &LoadBalancer, workload: &Deployment) -> Result<Deployment>;

    /// Remove this owner's reference from a workload.
    async fn release(&self, owner: &LoadBalancer, workload: &Deployment) -> Result<Deployment>;
}

pub struct KubeLoadBalancers {
    client: Client,
    store: Store<LoadBalancer>,
}

impl KubeLoadBalancers {
    pub fn new(client: Client, store: Store<LoadBalancer>) -> Self {
        Self { client, store }
    }

    fn api(&self, namespace: &str) -> Api<LoadBalancer> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl LoadBalancerApi for KubeLoadBalancers {
    fn get_cached(&self, namespace: &str, name: &str) -> Option<Arc<LoadBalancer>> {
        self.store
            .get(&ObjectRef::<LoadBalancer>::new(name).within(namespace))
    }

    async fn get_fresh(&self, namespace: &str, name: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub struct KubeWorkloads {
    client: Client,
    store: Store<Deployment>,
}

impl KubeWorkloads {
    pub fn new(client: Client, store: Store<Deployment>) -> Self {
        Self { client, store }
    }

    fn api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloads {
    fn list_cached(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<Deployment> {
        self.store
            .state()
            .into_iter()
            .filter(|d| d.namespace().as_deref() == Some(namespace))
            .filter(|d| labels::matches(selector, d.labels()))
            .map(|d| (*d).clone())
            .collect()
    }

    async fn create(&self, namespace: &str, workload: &Deployment) -> Result<Deployment> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), workload)
            .await?)
    }

    async fn update(&self, namespace: &str, workload: &Deployment) -> Result<Deployment> {
        Ok(self
            .api(namespace)
            .replace(&workload.name_any(), &PostParams::default(), workload)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> Result<()> {
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        self.api(namespace).delete(name, &dp).await?;
        Ok(())
    }

    async fn adopt(&self, owner: &LoadBalancer, workload: &Deployment) -> Result<Deployment> {
        let owner_ref = owner
            .controller_owner_ref(&())
            .expect("LoadBalancer from the API server always has a name");
        // The workload's own uid guards the patch: a delete-recreate of the
        // candidate between list and patch makes the API server reject it.
        let patch = serde_json::json!({
            "metadata": {
                "ownerReferences": [owner_ref],
                "uid": workload.uid(),
            }
        });
        Ok(self
            .api(&owner.namespace().unwrap_or_default())
            .patch(
                &workload.name_any(),
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await?)
    }

    async fn release(&self, owner: &LoadBalancer, workload: &Deployment) -> Result<Deployment> {
        let patch = serde_json::json!({
            "metadata": {
                "ownerReferences": [{ "$patch": "delete", "uid": owner.uid() }],
                "uid": workload.uid(),
            }
        });
        Ok(self
            .api(&owner.namespace().unwrap_or_default())
            .patch(
                &workload.name_any(),
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await?)
    }
}
