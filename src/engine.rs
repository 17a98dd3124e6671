//! The reconcile engine: per-key state machine, converge pass, cleanup and
//! the worker pool that drives them off the work queue.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Resource, ResourceExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::claim;
use crate::config::ProviderConfig;
use crate::converge::{self, ensure_workload};
use crate::crd::{calculate_replicas, LoadBalancer, LoadBalancerStatus, ProviderPhase, ProviderStatus};
use crate::desired::generate_workload;
use crate::error::{ProviderError, Result};
use crate::labels;
use crate::queue::RateLimitingQueue;
use crate::store::{LoadBalancerApi, WorkloadApi};
use crate::validation::validate_load_balancer;

/// One pending reconcile: the identity of the LoadBalancer whose observation
/// triggered it. Keys for the same object coalesce in the queue; a replaced
/// object (same name, new uid) hashes to a distinct key so its deletion pass
/// and its successor's first pass both run.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncItem {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl SyncItem {
    pub fn for_load_balancer(lb: &LoadBalancer) -> Self {
        Self {
            namespace: lb.namespace().unwrap_or_default(),
            name: lb.name_any(),
            uid: lb.uid().unwrap_or_default(),
        }
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// The ipvs provider controller.
///
/// Collaborators are injected at construction; the hosting process wires the
/// kube-backed stores in `main.rs`, tests wire the in-memory fakes.
pub struct Provider {
    cfg: ProviderConfig,
    lbs: Arc<dyn LoadBalancerApi>,
    workloads: Arc<dyn WorkloadApi>,
    queue: Arc<RateLimitingQueue<SyncItem>>,
}

impl Provider {
    pub fn new(
        cfg: ProviderConfig,
        lbs: Arc<dyn LoadBalancerApi>,
        workloads: Arc<dyn WorkloadApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            lbs,
            workloads,
            queue: RateLimitingQueue::new(),
        })
    }

    /// Host hook requesting (re)reconciliation of one LoadBalancer.
    /// Resources whose mode excludes this provider are not our
    /// responsibility and are dropped here.
    pub fn on_sync(&self, lb: &LoadBalancer) {
        if lb.spec.providers.ipvs.is_none() {
            return;
        }
        debug!(lb = %SyncItem::for_load_balancer(lb).key(), "sync requested");
        self.enqueue(lb);
    }

    /// Unconditional enqueue. Used by the deletion path, where the spec no
    /// longer matters: cleanup is driven by the recorded identity alone.
    pub fn enqueue(&self, lb: &LoadBalancer) {
        self.queue.add(SyncItem::for_load_balancer(lb));
    }

    /// Informer-cache lookup, exposed for the event handlers that resolve a
    /// workload notification to its owning LoadBalancer.
    pub fn load_balancer_cached(&self, namespace: &str, name: &str) -> Option<Arc<LoadBalancer>> {
        self.lbs.get_cached(namespace, name)
    }

    /// Start the worker pool and block until the stop signal fires, then
    /// shut the queue down and let in-flight work drain.
    pub async fn run(self: &Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(
            workers = self.cfg.workers,
            image = %self.cfg.image,
            "starting ipvs provider"
        );

        let handles: Vec<JoinHandle<()>> = (0..self.cfg.workers.max(1))
            .map(|_| {
                let provider = Arc::clone(self);
                tokio::spawn(async move { provider.worker_loop().await })
            })
            .collect();

        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }

        info!("shutting down ipvs provider");
        self.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "reconcile worker panicked");
            }
        }
    }

    async fn worker_loop(&self) {
        while let Some(item) = self.queue.get().await {
            match self.reconcile(&item).await {
                Ok(()) => self.queue.forget(&item),
                Err(e) => {
                    warn!(lb = %item.key(), error = %e, "reconcile failed, requeueing");
                    self.queue.add_rate_limited(item.clone());
                }
            }
            self.queue.done(&item);
        }
    }

    /// One full reconcile pass for a dequeued key.
    pub async fn reconcile(&self, item: &SyncItem) -> Result<()> {
        let start = Instant::now();

        // freshest cached copy; never reconcile against the triggering copy
        let Some(lb) = self.lbs.get_cached(&item.namespace, &item.name) else {
            warn!(lb = %item.key(), "LoadBalancer is gone, cleaning up provider workloads");
            return self.cleanup(item).await;
        };

        // replaced object: a pass for the new identity is (or will be) queued
        if lb.uid().unwrap_or_default() != item.uid {
            debug!(lb = %item.key(), "LoadBalancer was replaced, abandoning pass");
            return Ok(());
        }

        if let Err(e) = validate_load_balancer(&lb) {
            debug!(lb = %item.key(), error = %e, "invalid LoadBalancer spec");
            return Err(e);
        }

        let claimed = match claim::claim_workloads(&*self.lbs, &*self.workloads, &lb).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_abandonment() => {
                debug!(lb = %item.key(), error = %e, "abandoning pass");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if lb.meta().deletion_timestamp.is_some() {
            // finalization in progress; status-only sync deferred to the
            // pass that runs once it completes
            debug!(lb = %item.key(), "deletion in progress, leaving workloads alone");
            return Ok(());
        }

        let active = self.converge(&lb, claimed).await?;
        self.sync_status(&lb, &active).await?;

        debug!(lb = %item.key(), elapsed_ms = start.elapsed().as_millis() as u64, "finished syncing");
        Ok(())
    }

    /// Drive the claimed workload set to the desired state: one active
    /// workload (first with the deterministic name prefix), everything else
    /// scaled to zero, a brand-new workload when no candidate qualifies.
    async fn converge(&self, lb: &LoadBalancer, claimed: Vec<Deployment>) -> Result<Deployment> {
        let namespace = lb.namespace().unwrap_or_default();
        let desired = generate_workload(lb, &self.cfg);
        let prefix = labels::workload_prefix(&lb.name_any());

        let mut active: Option<Deployment> = None;
        for workload in claimed {
            let name = workload.name_any();

            if !name.starts_with(&prefix) || active.is_some() {
                // mis-named or surplus workload: retire it but keep the
                // object around for inspection
                if converge::replicas(&workload) == 0 {
                    continue;
                }
                info!(lb = %lb.name_any(), workload = %name, "scaling unexpected workload to zero");
                let mut retired = workload.clone();
                converge::set_replicas(&mut retired, 0);
                self.workloads.update(&namespace, &retired).await?;
                continue;
            }

            let outcome = ensure_workload(&desired, &workload);
            if outcome.changed {
                info!(lb = %lb.name_any(), workload = %name, "updating drifted workload");
                let updated = self.workloads.update(&namespace, &outcome.workload).await?;
                active = Some(updated);
            } else {
                active = Some(outcome.workload);
            }
        }

        match active {
            Some(active) => Ok(active),
            None => {
                info!(lb = %lb.name_any(), workload = %desired.name_any(), "creating workload");
                self.workloads.create(&namespace, &desired).await
            }
        }
    }

    /// Recompute status from the active workload and persist it, skipping
    /// the patch when nothing moved.
    async fn sync_status(&self, lb: &LoadBalancer, active: &Deployment) -> Result<()> {
        let desired_replicas = calculate_replicas(lb);
        let ready = active
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let phase = if ready >= desired_replicas && desired_replicas > 0 {
            ProviderPhase::Running
        } else {
            ProviderPhase::Pending
        };

        let status = LoadBalancerStatus {
            provider: Some(ProviderStatus {
                phase,
                workload: active.metadata.name.clone(),
                replicas: desired_replicas,
                ready_replicas: ready,
            }),
        };

        if lb.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.lbs
            .patch_status(
                &lb.namespace().unwrap_or_default(),
                &lb.name_any(),
                &status,
            )
            .await
    }

    /// Cascading cleanup once the LoadBalancer is confirmed gone.
    async fn cleanup(&self, item: &SyncItem) -> Result<()> {
        // destructive path: trust only the API server, not the cache
        match self.lbs.get_fresh(&item.namespace, &item.name).await? {
            Some(fresh) if fresh.uid().unwrap_or_default() == item.uid => {
                return Err(ProviderError::StaleRead {
                    namespace: item.namespace.clone(),
                    name: item.name.clone(),
                });
            }
            Some(_) => {
                // a replacement owns the selector now; its orphans are
                // garbage-collected through their dead owner references
                debug!(lb = %item.key(), "replacement LoadBalancer exists, skipping cleanup");
                return Ok(());
            }
            None => {}
        }

        let selector = labels::selector_for_key(&item.namespace, &item.name);
        for workload in self.workloads.list_cached(&item.namespace, &selector) {
            let name = workload.name_any();
            info!(lb = %item.key(), workload = %name, "deleting provider workload");
            if let Err(e) = self
                .workloads
                .delete(&item.namespace, &name, self.cfg.cleanup_grace_seconds)
                .await
            {
                warn!(lb = %item.key(), workload = %name, error = %e, "failed to delete workload");
            }
        }
        Ok(())
    }
}
