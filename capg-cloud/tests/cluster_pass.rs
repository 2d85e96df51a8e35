//! Integration tests running whole cluster passes against the in-memory cloud.

mod common;

use std::time::Duration;

use capg_cloud::cloud::MemoryCloudConfig;
use capg_cloud::types::{ApiEndpoint, InstanceStatus};
use capg_cloud::{
    Action, CloudError, ClusterGetter, ClusterSetter, Context, ControlPlaneAddressReconciler,
    InstanceReconciler, MachineGetter, MachinePoolReconciler, NetworkReconciler, ReconcilePass,
};
use common::{CLUSTER, Env, PROJECT, REGION, ZONE};

const MAX_PASSES: usize = 10;

#[tokio::test]
async fn test_cluster_converges_and_tears_down() {
    let env = Env::new(MemoryCloudConfig {
        boot_polls: 1,
        delete_polls: 1,
        ..Default::default()
    });
    env.publish_bootstrap("prod-cp-0");
    env.publish_bootstrap("workers");

    let cluster = env.cluster();
    let control_plane = env.control_plane("prod-cp-0");
    let network = NetworkReconciler::new(cluster.clone());
    let address = ControlPlaneAddressReconciler::new(cluster.clone());
    let instance = InstanceReconciler::new(control_plane.clone());
    let workers = MachinePoolReconciler::new(env.pool("workers", 2), Vec::new());
    let pass = ReconcilePass::new()
        .step("network", &network)
        .step("control-plane-address", &address)
        .step("control-plane", &instance)
        .step("workers", &workers);
    let ctx = Context::new();

    let all_running = || {
        control_plane.get_instance_status() == InstanceStatus::Running
            && workers
                .members()
                .iter()
                .all(|m| m.get_instance_status() == InstanceStatus::Running)
    };

    let mut passes = 0;
    while !all_running() {
        assert!(passes < MAX_PASSES, "cluster did not converge");
        let outcome = pass.reconcile(&ctx).await;
        assert!(outcome.is_done(), "{:?}", outcome.error);
        passes += 1;
    }

    assert_eq!(
        cluster.control_plane_endpoint(),
        Some(ApiEndpoint::new("34.120.0.1", 6443))
    );
    assert!(cluster.network().self_link.is_some());
    assert_eq!(env.cloud.instances().len(), 3);
    assert!(env.cloud.instances().iter().all(|i| {
        i.labels.get("capg-cluster-prod").map(String::as_str) == Some("owned")
    }));

    // Steady state makes no further backend changes.
    let stats = env.cloud.stats();
    assert!(pass.reconcile(&ctx).await.is_done());
    let after = env.cloud.stats();
    assert_eq!(after.insert_instance, stats.insert_instance);
    assert_eq!(after.insert_network, stats.insert_network);
    assert_eq!(after.insert_address, stats.insert_address);

    // Workers are drained before anything they depend on is removed.
    let outcome = pass.delete(&ctx).await;
    assert_eq!(outcome.action, Action::Requeue(Duration::from_secs(10)));
    assert!(outcome.completed.is_empty());
    assert!(env.cloud.network(PROJECT, "prod-net").is_some());

    let mut passes = 0;
    loop {
        assert!(passes < MAX_PASSES, "cluster did not tear down");
        let outcome = pass.delete(&ctx).await;
        passes += 1;
        if outcome.is_done() {
            break;
        }
        assert!(matches!(
            outcome.error,
            Some(CloudError::DeletionInProgress(_))
        ));
    }

    assert!(env.cloud.instances().is_empty());
    assert!(env.cloud.network(PROJECT, "prod-net").is_none());
    assert!(
        env.cloud
            .address(PROJECT, REGION, &format!("{}-apiserver", CLUSTER))
            .is_none()
    );
    assert_eq!(control_plane.get_instance_status(), InstanceStatus::Deleted);
}

#[tokio::test]
async fn test_transient_network_error_blocks_later_steps() {
    let env = Env::new(MemoryCloudConfig::default());
    env.publish_bootstrap("prod-cp-0");
    let cluster = env.cluster();
    let control_plane = env.control_plane("prod-cp-0");
    let network = NetworkReconciler::new(cluster.clone());
    let instance = InstanceReconciler::new(control_plane.clone());
    let pass = ReconcilePass::new()
        .step("network", &network)
        .step("control-plane", &instance);

    env.cloud
        .inject_error(CloudError::Transient("backend unavailable".into()));
    let outcome = pass.reconcile(&Context::new()).await;

    assert_eq!(outcome.action, Action::Requeue(Duration::from_secs(5)));
    assert_eq!(env.cloud.stats().insert_instance, 0);
    assert_eq!(control_plane.get_instance_status(), InstanceStatus::Unknown);

    let outcome = pass.reconcile(&Context::new()).await;
    assert!(outcome.is_done());
    assert!(env.cloud.instance(PROJECT, ZONE, "prod-cp-0").is_some());
}

#[tokio::test]
async fn test_endpoint_never_moves() {
    let env = Env::new(MemoryCloudConfig::default());
    let cluster = env.cluster();
    let address = ControlPlaneAddressReconciler::new(cluster.clone());
    let pass = ReconcilePass::new().step("control-plane-address", &address);

    assert!(pass.reconcile(&Context::new()).await.is_done());
    let endpoint = cluster.control_plane_endpoint();

    let err = cluster
        .set_control_plane_endpoint(ApiEndpoint::new("203.0.113.7", 6443))
        .unwrap_err();
    assert!(matches!(err, CloudError::EndpointConflict { .. }));
    assert_eq!(cluster.control_plane_endpoint(), endpoint);

    // A pass against a different port is an invariant violation and stops.
    let moved = ControlPlaneAddressReconciler::new(cluster.clone()).with_port(8443);
    let outcome = ReconcilePass::new()
        .step("control-plane-address", &moved)
        .reconcile(&Context::new())
        .await;
    assert_eq!(outcome.action, Action::Stop);
    assert_eq!(cluster.control_plane_endpoint(), endpoint);
}
