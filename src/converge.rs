//! Field-scoped convergence of an existing workload toward its descriptor.
//!
//! Only four fields are managed: labels (unioned), replica count, container
//! image, and node affinity (each replaced wholesale). Everything else on
//! the object belongs to other actors and is left untouched, and the change
//! flag is computed per field so an unchanged workload never burns an update
//! call.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Affinity, NodeAffinity, PodSpec};
use kube::ResourceExt;
use tracing::debug;

pub struct EnsureOutcome {
    /// The existing workload with desired fields merged in.
    pub workload: Deployment,
    /// True when any managed field differed.
    pub changed: bool,
}

pub fn ensure_workload(desired: &Deployment, existing: &Deployment) -> EnsureOutcome {
    let mut merged = existing.clone();

    // union labels, desired wins on conflicts
    let merged_labels = merged.labels_mut();
    for (k, v) in desired.metadata.labels.iter().flatten() {
        merged_labels.insert(k.clone(), v.clone());
    }
    set_replicas(&mut merged, replicas(desired));
    set_image(&mut merged, image(desired));
    set_node_affinity(&mut merged, node_affinity(desired).cloned());

    let labels_changed = merged.metadata.labels != existing.metadata.labels;
    let replicas_changed = replicas(&merged) != replicas(existing);
    let image_changed = image(&merged) != image(existing);
    let affinity_changed = node_affinity(&merged) != node_affinity(existing);

    let changed = labels_changed || replicas_changed || image_changed || affinity_changed;
    if changed {
        debug!(
            workload = %existing.name_any(),
            labels_changed,
            replicas_changed,
            image_changed,
            affinity_changed,
            "workload drifted from desired state"
        );
    }

    EnsureOutcome {
        workload: merged,
        changed,
    }
}

pub fn replicas(workload: &Deployment) -> i32 {
    workload
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0)
}

pub fn set_replicas(workload: &mut Deployment, replicas: i32) {
    workload
        .spec
        .get_or_insert_with(Default::default)
        .replicas = Some(replicas);
}

fn image(workload: &Deployment) -> Option<&str> {
    pod_spec(workload)?
        .containers
        .first()?
        .image
        .as_deref()
}

fn set_image(workload: &mut Deployment, image: Option<&str>) {
    let Some(image) = image else { return };
    let pod = pod_spec_mut(workload);
    if let Some(container) = pod.containers.first_mut() {
        container.image = Some(image.to_string());
    }
}

fn node_affinity(workload: &Deployment) -> Option<&NodeAffinity> {
    pod_spec(workload)?.affinity.as_ref()?.node_affinity.as_ref()
}

fn set_node_affinity(workload: &mut Deployment, affinity: Option<NodeAffinity>) {
    pod_spec_mut(workload)
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity = affinity;
}

fn pod_spec(workload: &Deployment) -> Option<&PodSpec> {
    workload.spec.as_ref()?.template.spec.as_ref()
}

fn pod_spec_mut(workload: &mut Deployment) -> &mut PodSpec {
    workload
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::desired::generate_workload;
    use crate::mocks::load_balancer;

    fn desired_and_existing() -> (Deployment, Deployment) {
        let lb = load_balancer("default", "lb1", "uid-1", Some(2));
        let desired = generate_workload(&lb, &ProviderConfig::new("registry.local/ipvs:1.4"));
        let mut existing = desired.clone();
        existing.metadata.name = Some("lb1-provider-ipvs-abcde".to_string());
        (desired, existing)
    }

    #[test]
    fn in_sync_workload_reports_no_change() {
        let (desired, existing) = desired_and_existing();
        let outcome = ensure_workload(&desired, &existing);
        assert!(!outcome.changed);
        assert_eq!(outcome.workload, existing);
    }

    #[test]
    fn replica_drift_is_detected_and_corrected() {
        let (desired, mut existing) = desired_and_existing();
        set_replicas(&mut existing, 5);
        let outcome = ensure_workload(&desired, &existing);
        assert!(outcome.changed);
        assert_eq!(replicas(&outcome.workload), 2);
    }

    #[test]
    fn image_drift_is_detected_and_corrected() {
        let (desired, mut existing) = desired_and_existing();
        set_image(&mut existing, Some("registry.local/ipvs:0.9"));
        let outcome = ensure_workload(&desired, &existing);
        assert!(outcome.changed);
        assert_eq!(
            image(&outcome.workload),
            Some("registry.local/ipvs:1.4")
        );
    }

    #[test]
    fn affinity_drift_is_detected_and_corrected() {
        let (desired, mut existing) = desired_and_existing();
        set_node_affinity(&mut existing, None);
        let outcome = ensure_workload(&desired, &existing);
        assert!(outcome.changed);
        assert_eq!(
            node_affinity(&outcome.workload),
            node_affinity(&desired)
        );
    }

    #[test]
    fn label_merge_keeps_unrelated_labels() {
        let (desired, mut existing) = desired_and_existing();
        existing
            .labels_mut()
            .insert("team".to_string(), "network".to_string());
        set_image(&mut existing, Some("registry.local/ipvs:0.9"));

        let outcome = ensure_workload(&desired, &existing);

        assert!(outcome.changed);
        assert_eq!(
            outcome.workload.labels().get("team").map(String::as_str),
            Some("network")
        );
    }

    #[test]
    fn desired_labels_overwrite_conflicting_keys() {
        let (desired, mut existing) = desired_and_existing();
        existing
            .labels_mut()
            .insert(crate::labels::LABEL_PROVIDER.to_string(), "rogue".to_string());

        let outcome = ensure_workload(&desired, &existing);

        assert!(outcome.changed);
        assert_eq!(
            outcome
                .workload
                .labels()
                .get(crate::labels::LABEL_PROVIDER)
                .map(String::as_str),
            Some("ipvs")
        );
    }
}
