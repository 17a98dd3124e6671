//! Reconcile-loop library for the ipvs LoadBalancer provider.
//!
//! A LoadBalancer resource declares a logical load balancer; this crate
//! converges a Deployment of IPVS director replicas toward it: claiming
//! label-matched workloads, keeping exactly one of them active, scaling
//! stragglers to zero and cascading deletion when the resource goes away.
//!
//! The hosting process constructs a [`engine::Provider`] with its
//! collaborators (see `main.rs` for the kube-backed wiring) and drives it
//! with a stop signal; everything else runs off the internal work queue.

pub mod claim;
pub mod config;
pub mod converge;
pub mod crd;
pub mod desired;
pub mod engine;
pub mod error;
pub mod events;
pub mod labels;
pub mod mocks;
pub mod queue;
pub mod store;
pub mod validation;
pub mod watch;

pub use config::ProviderConfig;
pub use crd::{LoadBalancer, LoadBalancerSpec, LoadBalancerStatus};
pub use engine::{Provider, SyncItem};
pub use error::{ProviderError, Result};
