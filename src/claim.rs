//! Ownership adjudication for label-selected workloads.
//!
//! Listing by selector and checking owner references are not atomic with a
//! concurrent delete of the LoadBalancer, so every pass re-derives claims
//! from scratch and guards the first adoption with an uncached read of the
//! owner (a lagging cache could otherwise adopt for a resource that was
//! deleted and recreated with a new identity).

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, warn};

use crate::crd::LoadBalancer;
use crate::error::{ProviderError, Result};
use crate::labels;
use crate::store::{LoadBalancerApi, WorkloadApi};

/// Narrow metadata capability adjudication needs from a candidate object.
pub trait OwnedMeta {
    fn labels(&self) -> Option<&BTreeMap<String, String>>;
    fn owner_references(&self) -> &[OwnerReference];
}

impl OwnedMeta for Deployment {
    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.labels.as_ref()
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references.as_deref().unwrap_or(&[])
    }
}

impl OwnedMeta for Pod {
    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.labels.as_ref()
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references.as_deref().unwrap_or(&[])
    }
}

/// Per-candidate claim decision. Recomputed every pass, never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Already controller-referenced to this LoadBalancer.
    Owned,
    /// Label match with no controller; may be adopted.
    Adopt,
    /// Ours by reference but no longer selected; drop the reference.
    Release,
    /// Somebody else's; leave it alone.
    Ignore,
}

pub fn adjudicate<T: OwnedMeta>(
    lb: &LoadBalancer,
    selector: &BTreeMap<String, String>,
    candidate: &T,
) -> Claim {
    let lb_uid = lb.uid().unwrap_or_default();
    let controller = candidate
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true));

    match controller {
        Some(r) if r.uid == lb_uid => {
            let empty = BTreeMap::new();
            let candidate_labels = OwnedMeta::labels(candidate).unwrap_or(&empty);
            if labels::matches(selector, candidate_labels) {
                Claim::Owned
            } else {
                Claim::Release
            }
        }
        Some(_) => Claim::Ignore,
        // never adopt for an owner that is already being torn down
        None if lb.meta().deletion_timestamp.is_some() => Claim::Ignore,
        None => Claim::Adopt,
    }
}

/// Authoritative set of workloads owned by `lb` after this pass.
///
/// Candidates are processed oldest-first (name as tie-break) so the converge
/// pass picks the same active workload every time. Adoption failures skip the
/// candidate; a guard failure proving the owner gone aborts the pass with
/// [`ProviderError::OwnerReplaced`].
pub async fn claim_workloads(
    lbs: &dyn LoadBalancerApi,
    workloads: &dyn WorkloadApi,
    lb: &LoadBalancer,
) -> Result<Vec<Deployment>> {
    let namespace = lb.namespace().unwrap_or_default();
    let selector = labels::selector(lb);

    let mut candidates = workloads.list_cached(&namespace, &selector);
    candidates.sort_by_key(|d| {
        (
            d.metadata.creation_timestamp.as_ref().map(|t| t.0),
            d.name_any(),
        )
    });

    let mut claimed = Vec::new();
    let mut adoption_allowed: Option<bool> = None;

    for candidate in candidates {
        let name = candidate.name_any();
        match adjudicate(lb, &selector, &candidate) {
            Claim::Owned => claimed.push(candidate),
            Claim::Adopt => {
                let allowed = match adoption_allowed {
                    Some(allowed) => allowed,
                    None => {
                        let allowed = adoption_guard(lbs, lb).await?;
                        adoption_allowed = Some(allowed);
                        allowed
                    }
                };
                if !allowed {
                    debug!(workload = %name, "owner is terminating, skipping adoption");
                    continue;
                }
                match workloads.adopt(lb, &candidate).await {
                    Ok(adopted) => {
                        debug!(workload = %name, "adopted orphaned workload");
                        claimed.push(adopted);
                    }
                    Err(e) => {
                        warn!(workload = %name, error = %e, "failed to adopt workload, skipping")
                    }
                }
            }
            Claim::Release => {
                if let Err(e) = workloads.release(lb, &candidate).await {
                    warn!(workload = %name, error = %e, "failed to release workload");
                }
            }
            Claim::Ignore => {}
        }
    }

    Ok(claimed)
}

/// Uncached recheck run before the first adoption of a pass.
///
/// `Ok(true)` allows adoption, `Ok(false)` means the owner is terminating
/// (adoptions skipped, pass continues), `Err(OwnerReplaced)` proves the
/// triggering object is gone.
async fn adoption_guard(lbs: &dyn LoadBalancerApi, lb: &LoadBalancer) -> Result<bool> {
    let namespace = lb.namespace().unwrap_or_default();
    let name = lb.name_any();
    let expected = lb.uid().unwrap_or_default();

    match lbs.get_fresh(&namespace, &name).await? {
        None => Err(ProviderError::OwnerReplaced {
            namespace,
            name,
            expected,
            actual: "<deleted>".to_string(),
        }),
        Some(fresh) if fresh.uid().unwrap_or_default() != expected => {
            Err(ProviderError::OwnerReplaced {
                namespace,
                name,
                expected,
                actual: fresh.uid().unwrap_or_default(),
            })
        }
        Some(fresh) => Ok(fresh.meta().deletion_timestamp.is_none()),
    }
}
