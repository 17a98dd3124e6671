//! End-to-end reconcile scenarios over the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use ipvs_operator::converge::replicas;
use ipvs_operator::crd::ProviderPhase;
use ipvs_operator::desired::generate_workload;
use ipvs_operator::engine::{Provider, SyncItem};
use ipvs_operator::mocks::{
    load_balancer, orphan_workload, owned_workload, FakeLoadBalancers, FakeWorkloads, WorkloadOp,
};
use ipvs_operator::store::{LoadBalancerApi, WorkloadApi};
use ipvs_operator::{LoadBalancer, ProviderConfig, ProviderError};

const IMAGE: &str = "registry.local/ipvs:1.4";

fn cfg() -> ProviderConfig {
    ProviderConfig::new(IMAGE)
}

fn provider(lbs: &Arc<FakeLoadBalancers>, workloads: &Arc<FakeWorkloads>) -> Arc<Provider> {
    Provider::new(
        cfg(),
        Arc::clone(lbs) as Arc<dyn LoadBalancerApi>,
        Arc::clone(workloads) as Arc<dyn WorkloadApi>,
    )
}

/// A workload exactly matching what the generator would produce, renamed so
/// the random suffix is under test control.
fn in_sync_workload(lb: &LoadBalancer, name: &str) -> Deployment {
    let mut wl = generate_workload(lb, &cfg());
    wl.metadata.name = Some(name.to_string());
    wl
}

#[tokio::test]
async fn creates_single_workload_for_new_load_balancer() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    let names = workloads.names();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("lb1-provider-ipvs-"));
    assert_eq!(names[0].len(), "lb1-provider-ipvs-".len() + 5);

    let created = workloads.get(&names[0]).unwrap();
    assert_eq!(replicas(&created), 2);
    let refs = created.metadata.owner_references.unwrap();
    assert_eq!(refs[0].name, "lb1");
    assert_eq!(refs[0].uid, "uid-1");
    assert_eq!(refs[0].controller, Some(true));
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);
    let item = SyncItem::for_load_balancer(&lb);

    provider.reconcile(&item).await.unwrap();
    let ops_after_first = workloads.ops().len();
    let patches_after_first = lbs.status_patches.lock().unwrap().len();

    provider.reconcile(&item).await.unwrap();

    assert_eq!(
        workloads.ops().len(),
        ops_after_first,
        "second pass must not create or update anything"
    );
    assert_eq!(
        lbs.status_patches.lock().unwrap().len(),
        patches_after_first,
        "second pass must not re-patch an unchanged status"
    );
}

#[tokio::test]
async fn enforces_at_most_one_active_workload() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let mut first = in_sync_workload(&lb, "lb1-provider-ipvs-aaaaa");
    first.metadata.creation_timestamp = Some(Time(chrono::Utc::now() - chrono::Duration::hours(1)));
    let mut second = in_sync_workload(&lb, "lb1-provider-ipvs-bbbbb");
    second.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
    let workloads = FakeWorkloads::with(vec![second, first]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    // the older workload stays active untouched, the surplus one is retired
    assert_eq!(
        workloads.ops(),
        vec![WorkloadOp::Update("lb1-provider-ipvs-bbbbb".to_string())]
    );
    let active: Vec<String> = workloads
        .names()
        .into_iter()
        .filter(|n| replicas(&workloads.get(n).unwrap()) > 0)
        .collect();
    assert_eq!(active, vec!["lb1-provider-ipvs-aaaaa".to_string()]);
}

#[tokio::test]
async fn scales_down_mis_prefixed_workload_without_touching_target() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let target = in_sync_workload(&lb, "lb1-provider-ipvs-aaaaa");
    let stray = owned_workload(&lb, "lb1-nginx-bbbbb", 3);
    let workloads = FakeWorkloads::with(vec![target, stray]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    assert_eq!(
        workloads.ops(),
        vec![WorkloadOp::Update("lb1-nginx-bbbbb".to_string())]
    );
    assert_eq!(replicas(&workloads.get("lb1-nginx-bbbbb").unwrap()), 0);
    assert_eq!(replicas(&workloads.get("lb1-provider-ipvs-aaaaa").unwrap()), 2);
}

#[tokio::test]
async fn already_retired_workloads_are_left_alone() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let target = in_sync_workload(&lb, "lb1-provider-ipvs-aaaaa");
    let retired = owned_workload(&lb, "lb1-nginx-bbbbb", 0);
    let workloads = FakeWorkloads::with(vec![target, retired]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    assert!(workloads.ops().is_empty());
}

#[tokio::test]
async fn converge_preserves_unrelated_labels_on_image_change() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let mut target = in_sync_workload(&lb, "lb1-provider-ipvs-aaaaa");
    target
        .labels_mut()
        .insert("team".to_string(), "network".to_string());
    target
        .spec
        .as_mut()
        .unwrap()
        .template
        .spec
        .as_mut()
        .unwrap()
        .containers[0]
        .image = Some("registry.local/ipvs:0.9".to_string());
    let workloads = FakeWorkloads::with(vec![target]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    let updated = workloads.get("lb1-provider-ipvs-aaaaa").unwrap();
    assert_eq!(
        updated.labels().get("team").map(String::as_str),
        Some("network")
    );
    let image = updated.spec.unwrap().template.spec.unwrap().containers[0]
        .image
        .clone();
    assert_eq!(image.as_deref(), Some(IMAGE));
}

#[tokio::test]
async fn adoption_race_leaves_no_stale_owner_reference() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::new();
    lbs.set_cached_only(&lb); // deleted on the server, cache lagging
    let orphan = orphan_workload(&lb, "lb1-provider-ipvs-aaaaa", 2);
    let workloads = FakeWorkloads::with(vec![orphan]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    assert!(workloads.ops().is_empty(), "no adoption may be attempted");
    let workload = workloads.get("lb1-provider-ipvs-aaaaa").unwrap();
    assert!(workload
        .metadata
        .owner_references
        .unwrap_or_default()
        .is_empty());
}

#[tokio::test]
async fn identity_mismatch_abandons_pass() {
    let replacement = load_balancer("default", "lb1", "uid-2", Some(2));
    let lbs = FakeLoadBalancers::with(&replacement);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);

    // pass triggered by the old object
    let old = load_balancer("default", "lb1", "uid-1", Some(2));
    provider
        .reconcile(&SyncItem::for_load_balancer(&old))
        .await
        .unwrap();

    assert!(workloads.ops().is_empty());
    assert!(lbs.status_patches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn deletion_in_progress_freezes_workloads() {
    let mut lb = load_balancer("default", "lb1", "uid-1", Some(2));
    lb.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::with(vec![in_sync_workload(&lb, "lb1-provider-ipvs-aaaaa")]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    assert!(workloads.ops().is_empty());
    assert!(lbs.status_patches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_spec_fails_the_pass() {
    let mut lb = load_balancer("default", "lb1", "uid-1", Some(2));
    lb.spec.providers.ipvs.as_mut().unwrap().vip = "not-an-ip".to_string();
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);

    let err = provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Validation(_)));
    assert!(workloads.ops().is_empty());
}

#[tokio::test]
async fn store_failure_during_converge_propagates() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let mut target = in_sync_workload(&lb, "lb1-provider-ipvs-aaaaa");
    target
        .spec
        .as_mut()
        .unwrap()
        .template
        .spec
        .as_mut()
        .unwrap()
        .containers[0]
        .image = Some("registry.local/ipvs:0.9".to_string());
    let workloads = FakeWorkloads::with(vec![target]);
    workloads.fail_updates_of("lb1-provider-ipvs-aaaaa");
    let provider = provider(&lbs, &workloads);

    let err = provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Store(_)));
}

#[tokio::test]
async fn cleanup_deletes_all_owned_workloads_with_grace() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let other = load_balancer("default", "lb2", "uid-9", Some(1));
    let lbs = FakeLoadBalancers::new(); // lb1 fully gone
    let workloads = FakeWorkloads::with(vec![
        owned_workload(&lb, "lb1-provider-ipvs-aaaaa", 2),
        orphan_workload(&lb, "lb1-provider-ipvs-bbbbb", 0),
        owned_workload(&other, "lb2-provider-ipvs-ccccc", 1),
    ]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    assert_eq!(
        workloads.ops(),
        vec![
            WorkloadOp::Delete {
                name: "lb1-provider-ipvs-aaaaa".to_string(),
                grace_period_seconds: 30
            },
            WorkloadOp::Delete {
                name: "lb1-provider-ipvs-bbbbb".to_string(),
                grace_period_seconds: 30
            },
        ]
    );
    // the other LoadBalancer's workload survives
    assert_eq!(workloads.names(), vec!["lb2-provider-ipvs-ccccc".to_string()]);
}

#[tokio::test]
async fn cleanup_is_refused_while_cache_lags() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::new();
    lbs.set_fresh_only(&lb); // the API server still has it
    let workloads = FakeWorkloads::with(vec![owned_workload(&lb, "lb1-provider-ipvs-aaaaa", 2)]);
    let provider = provider(&lbs, &workloads);

    let err = provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::StaleRead { .. }));
    assert!(workloads.ops().is_empty(), "nothing may be deleted");
}

#[tokio::test]
async fn cleanup_is_skipped_when_a_replacement_exists() {
    let old = load_balancer("default", "lb1", "uid-1", Some(2));
    let replacement = load_balancer("default", "lb1", "uid-2", Some(2));
    let lbs = FakeLoadBalancers::new();
    lbs.set_fresh_only(&replacement);
    let workloads = FakeWorkloads::with(vec![owned_workload(&replacement, "lb1-provider-ipvs-aaaaa", 2)]);
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&old))
        .await
        .unwrap();

    assert!(workloads.ops().is_empty());
}

#[tokio::test]
async fn status_reflects_the_active_workload() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);

    provider
        .reconcile(&SyncItem::for_load_balancer(&lb))
        .await
        .unwrap();

    let patches = lbs.status_patches.lock().unwrap();
    assert_eq!(patches.len(), 1);
    let (key, status) = &patches[0];
    assert_eq!(key, "default/lb1");
    let provider_status = status.provider.as_ref().unwrap();
    assert_eq!(provider_status.replicas, 2);
    assert_eq!(provider_status.ready_replicas, 0);
    assert_eq!(provider_status.phase, ProviderPhase::Pending);
    assert!(provider_status
        .workload
        .as_deref()
        .unwrap()
        .starts_with("lb1-provider-ipvs-"));
}

#[tokio::test]
async fn run_drains_enqueued_work_and_stops_on_signal() {
    let lb = load_balancer("default", "lb1", "uid-1", Some(2));
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let running = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move { provider.run(stop_rx).await })
    };

    provider.on_sync(&lb);

    for _ in 0..200 {
        if !workloads.ops().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(
        matches!(workloads.ops().first(), Some(WorkloadOp::Create(_))),
        "worker should have processed the enqueued key"
    );

    stop_tx.send(true).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn on_sync_ignores_resources_of_other_providers() {
    let mut lb = load_balancer("default", "lb1", "uid-1", Some(2));
    lb.spec.providers.ipvs = None;
    let lbs = FakeLoadBalancers::with(&lb);
    let workloads = FakeWorkloads::new();
    let provider = provider(&lbs, &workloads);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let running = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move { provider.run(stop_rx).await })
    };

    provider.on_sync(&lb);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(workloads.ops().is_empty());
    assert!(lbs.status_patches.lock().unwrap().is_empty());

    stop_tx.send(true).unwrap();
    running.await.unwrap();
}
