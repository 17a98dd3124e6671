//! Structural validation of LoadBalancer specs.

use std::net::IpAddr;

use kube::ResourceExt;

use crate::crd::LoadBalancer;
use crate::error::{ProviderError, Result};
use crate::labels::WORKLOAD_NAME_SUFFIX;

// Workload names must stay valid DNS labels after the deterministic suffix
// and the 6-character random disambiguator are appended.
const MAX_NAME_LEN: usize = 63 - WORKLOAD_NAME_SUFFIX.len() - 6;

const KNOWN_SCHEDULERS: &[&str] = &["rr", "wrr", "lc", "wlc", "sh", "dh"];

pub fn validate_load_balancer(lb: &LoadBalancer) -> Result<()> {
    let name = lb.name_any();
    if name.is_empty() {
        return Err(ProviderError::validation("metadata.name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ProviderError::validation(format!(
            "metadata.name {name:?} is longer than {MAX_NAME_LEN} characters"
        )));
    }

    let Some(ipvs) = lb.spec.providers.ipvs.as_ref() else {
        return Err(ProviderError::validation(
            "spec.providers.ipvs is not configured",
        ));
    };

    if ipvs.vip.parse::<IpAddr>().is_err() {
        return Err(ProviderError::validation(format!(
            "spec.providers.ipvs.vip {:?} is not a valid IP address",
            ipvs.vip
        )));
    }
    if !KNOWN_SCHEDULERS.contains(&ipvs.scheduler.as_str()) {
        return Err(ProviderError::validation(format!(
            "spec.providers.ipvs.scheduler {:?} is not one of {KNOWN_SCHEDULERS:?}",
            ipvs.scheduler
        )));
    }

    if lb.spec.replicas.is_none() && lb.spec.nodes.is_empty() {
        return Err(ProviderError::validation(
            "spec.replicas is unset and spec.nodes is empty; replica count cannot be derived",
        ));
    }

    Ok(())
}
