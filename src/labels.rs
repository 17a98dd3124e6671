//! Label and naming conventions shared by every provider component.
//!
//! Two labels identify a workload as belonging to this provider: the
//! `created-by` label encodes the owning LoadBalancer's namespace and name,
//! and the `provider` label carries the provider's own name. The pair is both
//! the stamp put on generated workloads and the selector used to find them.

use std::collections::BTreeMap;

use kube::ResourceExt;
use rand::Rng;

use crate::crd::LoadBalancer;

/// Label key recording which LoadBalancer created a workload.
pub const LABEL_CREATED_BY: &str = "loadbalancer.lbops.io/created-by";

/// Label key identifying the provider that manages a workload.
pub const LABEL_PROVIDER: &str = "loadbalancer.lbops.io/provider";

/// This provider's identity, the value of [`LABEL_PROVIDER`].
pub const PROVIDER_NAME: &str = "ipvs";

/// Deterministic suffix appended to the owning LoadBalancer's name when
/// generating workload names.
pub const WORKLOAD_NAME_SUFFIX: &str = "-provider-ipvs";

const SUFFIX_LEN: usize = 5;
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `created-by` label value for a LoadBalancer.
///
/// Namespaces cannot contain `.`, so `<namespace>.<name>` is reversible by
/// splitting on the first dot even though names may contain dots.
pub fn created_by_value(namespace: &str, name: &str) -> String {
    format!("{namespace}.{name}")
}

/// Inverse of [`created_by_value`].
pub fn parse_created_by(value: &str) -> Option<(&str, &str)> {
    value
        .split_once('.')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
}

/// Full selector identifying workloads owned by one LoadBalancer.
pub fn selector(lb: &LoadBalancer) -> BTreeMap<String, String> {
    let mut set = BTreeMap::new();
    set.insert(
        LABEL_CREATED_BY.to_string(),
        created_by_value(&lb.namespace().unwrap_or_default(), &lb.name_any()),
    );
    set.insert(LABEL_PROVIDER.to_string(), PROVIDER_NAME.to_string());
    set
}

/// Selector derived from a (namespace, name) key, for passes where the
/// LoadBalancer object itself is gone.
pub fn selector_for_key(namespace: &str, name: &str) -> BTreeMap<String, String> {
    let mut set = BTreeMap::new();
    set.insert(
        LABEL_CREATED_BY.to_string(),
        created_by_value(namespace, name),
    );
    set.insert(LABEL_PROVIDER.to_string(), PROVIDER_NAME.to_string());
    set
}

/// True when every selector entry is present in `labels`.
pub fn matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
}

/// True when the label set carries this provider's identity label.
pub fn is_provider_owned(labels: &BTreeMap<String, String>) -> bool {
    labels.get(LABEL_PROVIDER).map(String::as_str) == Some(PROVIDER_NAME)
}

/// Deterministic name prefix every workload of a LoadBalancer must carry.
pub fn workload_prefix(lb_name: &str) -> String {
    format!("{lb_name}{WORKLOAD_NAME_SUFFIX}")
}

/// Node label key whose value "true" marks a node as designated for this
/// LoadBalancer. Written by the placement mechanism, only read here.
pub fn node_affinity_key(namespace: &str, name: &str) -> String {
    format!("loadbalancer.lbops.io/{namespace}.{name}")
}

/// Fresh workload name: deterministic prefix plus a random disambiguator.
/// Minted only when a brand-new workload is created.
pub fn generate_workload_name(lb_name: &str) -> String {
    format!("{}-{}", workload_prefix(lb_name), random_suffix())
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}
