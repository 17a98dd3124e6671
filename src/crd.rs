use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// LoadBalancer declares one logical load-balancer instance.
///
/// The provider controller realizes it as a Deployment of IPVS director
/// replicas pinned to the resource's designated nodes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "networking.lbops.io",
    version = "v1alpha1",
    kind = "LoadBalancer",
    plural = "loadbalancers",
    namespaced
)]
#[kube(status = "LoadBalancerStatus")]
#[kube(shortname = "lb")]
pub struct LoadBalancerSpec {
    /// Exposure type of the load balancer
    #[serde(default, rename = "type")]
    pub lb_type: LoadBalancerType,

    /// Names of the nodes designated to run director replicas.
    /// Also the default sizing source when `replicas` is unset.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Explicit director replica count; overrides node-derived sizing
    pub replicas: Option<i32>,

    /// Per-provider configuration
    #[serde(default)]
    pub providers: ProvidersSpec,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerType {
    #[default]
    External,
    Internal,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ProvidersSpec {
    /// IPVS direct-routing provider
    pub ipvs: Option<IpvsProviderConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct IpvsProviderConfig {
    /// Virtual IP announced by the director set
    pub vip: String,

    /// IPVS scheduling algorithm
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LoadBalancerStatus {
    /// Observed state of the provider workload
    pub provider: Option<ProviderStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ProviderStatus {
    /// Current phase of the director set
    pub phase: ProviderPhase,

    /// Name of the active workload
    pub workload: Option<String>,

    /// Desired director replicas
    pub replicas: i32,

    /// Director replicas reporting ready
    pub ready_replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ProviderPhase {
    Pending,
    Running,
}

fn default_scheduler() -> String {
    "rr".to_string()
}

/// Effective director replica count for a LoadBalancer.
///
/// An explicit `spec.replicas` wins; otherwise one replica per designated
/// node. Validation guarantees at least one sizing source is present.
pub fn calculate_replicas(lb: &LoadBalancer) -> i32 {
    lb.spec
        .replicas
        .unwrap_or(lb.spec.nodes.len() as i32)
        .max(0)
}
