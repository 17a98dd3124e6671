//! In-memory fakes and fixtures for exercising the reconcile engine without
//! an API server.
//!
//! The fakes keep separate "cached" and "fresh" views so tests can stage the
//! races the engine must survive: a lagging informer cache, a LoadBalancer
//! replaced between list and adoption, a delete observed before the API
//! server agrees. Every mutating call is recorded for assertion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};

use crate::crd::{LoadBalancer, LoadBalancerStatus};
use crate::error::{ProviderError, Result};
use crate::labels;
use crate::store::{LoadBalancerApi, WorkloadApi};

/// LoadBalancer fixture with the ipvs provider configured.
pub fn load_balancer(namespace: &str, name: &str, uid: &str, replicas: Option<i32>) -> LoadBalancer {
    let mut lb = LoadBalancer::new(
        name,
        serde_json::from_value(serde_json::json!({
            "nodes": ["node-1", "node-2"],
            "replicas": replicas,
            "providers": { "ipvs": { "vip": "10.0.0.10" } }
        }))
        .expect("valid fixture spec"),
    );
    lb.metadata.namespace = Some(namespace.to_string());
    lb.metadata.uid = Some(uid.to_string());
    lb
}

/// Workload fixture owned (controller-referenced) by `lb`.
pub fn owned_workload(lb: &LoadBalancer, name: &str, replicas: i32) -> Deployment {
    let mut wl = orphan_workload(lb, name, replicas);
    wl.metadata.owner_references = Some(vec![lb
        .controller_owner_ref(&())
        .expect("fixture LoadBalancer has a name")]);
    wl
}

/// Workload fixture carrying the selector labels but no owner reference.
pub fn orphan_workload(lb: &LoadBalancer, name: &str, replicas: i32) -> Deployment {
    let selector = labels::selector(lb);
    Deployment {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            namespace: lb.namespace(),
            uid: Some(format!("wl-uid-{name}")),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn not_found(name: &str) -> ProviderError {
    ProviderError::Store(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{name} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

fn server_error(msg: &str) -> ProviderError {
    ProviderError::Store(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: msg.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

/// Fake LoadBalancer store with independently staged cached and fresh views.
#[derive(Default)]
pub struct FakeLoadBalancers {
    cached: RwLock<HashMap<(String, String), LoadBalancer>>,
    fresh: RwLock<HashMap<(String, String), LoadBalancer>>,
    /// Recorded status patches as `(namespace/name, status)`.
    pub status_patches: Mutex<Vec<(String, LoadBalancerStatus)>>,
}

impl FakeLoadBalancers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store with `lb` present in both views.
    pub fn with(lb: &LoadBalancer) -> Arc<Self> {
        let fake = Self::new();
        fake.insert(lb);
        fake
    }

    /// Put `lb` into both views.
    pub fn insert(&self, lb: &LoadBalancer) {
        let k = key(&lb.namespace().unwrap_or_default(), &lb.name_any());
        self.cached.write().unwrap().insert(k.clone(), lb.clone());
        self.fresh.write().unwrap().insert(k, lb.clone());
    }

    /// Stage a lagging cache: present only in the cached view.
    pub fn set_cached_only(&self, lb: &LoadBalancer) {
        let k = key(&lb.namespace().unwrap_or_default(), &lb.name_any());
        self.cached.write().unwrap().insert(k.clone(), lb.clone());
        self.fresh.write().unwrap().remove(&k);
    }

    /// Stage the inverse lag: the API server has it, the cache does not.
    pub fn set_fresh_only(&self, lb: &LoadBalancer) {
        let k = key(&lb.namespace().unwrap_or_default(), &lb.name_any());
        self.fresh.write().unwrap().insert(k.clone(), lb.clone());
        self.cached.write().unwrap().remove(&k);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let k = key(namespace, name);
        self.cached.write().unwrap().remove(&k);
        self.fresh.write().unwrap().remove(&k);
    }
}

#[async_trait]
impl LoadBalancerApi for FakeLoadBalancers {
    fn get_cached(&self, namespace: &str, name: &str) -> Option<Arc<LoadBalancer>> {
        self.cached
            .read()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .map(Arc::new)
    }

    async fn get_fresh(&self, namespace: &str, name: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.fresh.read().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<()> {
        self.status_patches
            .lock()
            .unwrap()
            .push((format!("{namespace}/{name}"), status.clone()));
        // a real cluster would feed the patched object back through the watch
        let k = key(namespace, name);
        for view in [&self.cached, &self.fresh] {
            if let Some(lb) = view.write().unwrap().get_mut(&k) {
                lb.status = Some(status.clone());
            }
        }
        Ok(())
    }
}

/// Every mutation the fake workload store has seen, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadOp {
    Create(String),
    Update(String),
    Delete { name: String, grace_period_seconds: u32 },
    Adopt(String),
    Release(String),
}

/// Fake workload store backing both the cached list and the mutation calls.
#[derive(Default)]
pub struct FakeWorkloads {
    items: RwLock<Vec<Deployment>>,
    fail_updates: Mutex<HashSet<String>>,
    pub ops: Mutex<Vec<WorkloadOp>>,
}

impl FakeWorkloads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(workloads: Vec<Deployment>) -> Arc<Self> {
        let fake = Self::new();
        *fake.items.write().unwrap() = workloads;
        fake
    }

    /// Make every update of `name` fail with a server error.
    pub fn fail_updates_of(&self, name: &str) {
        self.fail_updates.lock().unwrap().insert(name.to_string());
    }

    pub fn ops(&self) -> Vec<WorkloadOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn get(&self, name: &str) -> Option<Deployment> {
        self.items
            .read()
            .unwrap()
            .iter()
            .find(|d| d.name_any() == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.items
            .read()
            .unwrap()
            .iter()
            .map(|d| d.name_any())
            .collect()
    }

    fn record(&self, op: WorkloadOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl WorkloadApi for FakeWorkloads {
    fn list_cached(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<Deployment> {
        self.items
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.namespace().as_deref() == Some(namespace))
            .filter(|d| labels::matches(selector, d.labels()))
            .cloned()
            .collect()
    }

    async fn create(&self, namespace: &str, workload: &Deployment) -> Result<Deployment> {
        self.record(WorkloadOp::Create(workload.name_any()));
        let mut items = self.items.write().unwrap();
        if items
            .iter()
            .any(|d| d.name_any() == workload.name_any() && d.namespace().as_deref() == Some(namespace))
        {
            return Err(server_error("already exists"));
        }
        items.push(workload.clone());
        Ok(workload.clone())
    }

    async fn update(&self, namespace: &str, workload: &Deployment) -> Result<Deployment> {
        let name = workload.name_any();
        self.record(WorkloadOp::Update(name.clone()));
        if self.fail_updates.lock().unwrap().contains(&name) {
            return Err(server_error("injected update failure"));
        }
        let mut items = self.items.write().unwrap();
        let Some(slot) = items
            .iter_mut()
            .find(|d| d.name_any() == name && d.namespace().as_deref() == Some(namespace))
        else {
            return Err(not_found(&name));
        };
        *slot = workload.clone();
        Ok(workload.clone())
    }

    async fn delete(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> Result<()> {
        self.record(WorkloadOp::Delete {
            name: name.to_string(),
            grace_period_seconds,
        });
        let mut items = self.items.write().unwrap();
        let before = items.len();
        items.retain(|d| !(d.name_any() == name && d.namespace().as_deref() == Some(namespace)));
        if items.len() == before {
            return Err(not_found(name));
        }
        Ok(())
    }

    async fn adopt(&self, owner: &LoadBalancer, workload: &Deployment) -> Result<Deployment> {
        let name = workload.name_any();
        self.record(WorkloadOp::Adopt(name.clone()));
        let owner_ref = owner
            .controller_owner_ref(&())
            .expect("fixture LoadBalancer has a name");
        let mut items = self.items.write().unwrap();
        let Some(slot) = items.iter_mut().find(|d| d.name_any() == name) else {
            return Err(not_found(&name));
        };
        slot.metadata.owner_references = Some(vec![owner_ref]);
        Ok(slot.clone())
    }

    async fn release(&self, owner: &LoadBalancer, workload: &Deployment) -> Result<Deployment> {
        let name = workload.name_any();
        self.record(WorkloadOp::Release(name.clone()));
        let owner_uid = owner.uid().unwrap_or_default();
        let mut items = self.items.write().unwrap();
        let Some(slot) = items.iter_mut().find(|d| d.name_any() == name) else {
            return Err(not_found(&name));
        };
        if let Some(refs) = slot.metadata.owner_references.as_mut() {
            refs.retain(|r| r.uid != owner_uid);
        }
        Ok(slot.clone())
    }
}
