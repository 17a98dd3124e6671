//! Desired-state generation: LoadBalancer spec in, workload descriptor out.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, EnvVarSource, HostPathVolumeSource, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};

use crate::config::ProviderConfig;
use crate::crd::{calculate_replicas, LoadBalancer};
use crate::labels;

const TERMINATION_GRACE_SECONDS: i64 = 30;
const MODULES_VOLUME: &str = "modules";
const MODULES_PATH: &str = "/lib/modules";

/// Fully-formed workload descriptor for a LoadBalancer.
///
/// The name carries a fresh random suffix; callers only use it when creating
/// a brand-new workload, existing workloads keep the name they were born
/// with.
pub fn generate_workload(lb: &LoadBalancer, cfg: &ProviderConfig) -> Deployment {
    let namespace = lb.namespace().unwrap_or_default();
    let name = lb.name_any();
    let selector = labels::selector(lb);
    let replicas = calculate_replicas(lb);

    Deployment {
        metadata: ObjectMeta {
            name: Some(labels::generate_workload_name(&name)),
            namespace: Some(namespace.clone()),
            labels: Some(selector.clone()),
            owner_references: Some(vec![lb
                .controller_owner_ref(&())
                .expect("validated LoadBalancer always has a name")]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
                    affinity: Some(Affinity {
                        // run on the nodes designated for this LoadBalancer
                        node_affinity: Some(node_affinity(&namespace, &name)),
                        // never co-locate two directors on one host
                        pod_anti_affinity: Some(pod_anti_affinity()),
                        ..Default::default()
                    }),
                    tolerations: Some(control_plane_tolerations()),
                    containers: vec![director_container(lb, cfg)],
                    volumes: Some(vec![Volume {
                        name: MODULES_VOLUME.to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: MODULES_PATH.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_affinity(namespace: &str, name: &str) -> NodeAffinity {
    NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: labels::node_affinity_key(namespace, name),
                    operator: "In".to_string(),
                    values: Some(vec!["true".to_string()]),
                }]),
                ..Default::default()
            }],
        }),
        ..Default::default()
    }
}

fn pod_anti_affinity() -> PodAntiAffinity {
    let mut provider_only = BTreeMap::new();
    provider_only.insert(
        labels::LABEL_PROVIDER.to_string(),
        labels::PROVIDER_NAME.to_string(),
    );
    PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(provider_only),
                ..Default::default()
            }),
            topology_key: "kubernetes.io/hostname".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn control_plane_tolerations() -> Vec<Toleration> {
    ["node-role.kubernetes.io/master", "node-role.kubernetes.io/control-plane"]
        .into_iter()
        .map(|key| Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        })
        .collect()
}

fn director_container(lb: &LoadBalancer, cfg: &ProviderConfig) -> Container {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity("200m".to_string()));
    limits.insert("memory".to_string(), Quantity("50Mi".to_string()));

    Container {
        name: labels::PROVIDER_NAME.to_string(),
        image: Some(cfg.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        resources: Some(ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(director_env(lb)),
        volume_mounts: Some(vec![VolumeMount {
            name: MODULES_VOLUME.to_string(),
            mount_path: MODULES_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn director_env(lb: &LoadBalancer) -> Vec<EnvVar> {
    let mut env = vec![
        downward_env("POD_NAME", "metadata.name"),
        downward_env("POD_NAMESPACE", "metadata.namespace"),
        EnvVar {
            name: "LOADBALANCER_NAMESPACE".to_string(),
            value: Some(lb.namespace().unwrap_or_default()),
            ..Default::default()
        },
        EnvVar {
            name: "LOADBALANCER_NAME".to_string(),
            value: Some(lb.name_any()),
            ..Default::default()
        },
    ];
    if let Some(ipvs) = lb.spec.providers.ipvs.as_ref() {
        env.push(EnvVar {
            name: "LOADBALANCER_VIP".to_string(),
            value: Some(ipvs.vip.clone()),
            ..Default::default()
        });
    }
    env
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
