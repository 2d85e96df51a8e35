//! Integration tests for the machine lifecycle against the in-memory cloud.

mod common;

use std::time::Duration;

use capg_cloud::cloud::MemoryCloudConfig;
use capg_cloud::types::{InstanceStatus, MachineStatus, MachineStatusError, NodeAddress};
use capg_cloud::{
    Action, CloudError, Context, InstanceReconciler, MachineGetter, ReconcilePass, Reconciler,
};
use common::{Env, PROJECT, ZONE};
use tokio_test::{assert_err, assert_ok};

fn booting() -> MemoryCloudConfig {
    MemoryCloudConfig {
        boot_polls: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_new_machine_goes_to_provisioning() {
    let env = Env::new(booting());
    env.publish_bootstrap("m1");
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());

    assert_ok!(r.reconcile(&Context::new()).await);

    assert_eq!(machine.get_instance_status(), InstanceStatus::Provisioning);
    assert_eq!(
        machine.get_provider_id().as_deref(),
        Some("gce://acme/us-east1-b/m1")
    );
    assert!(machine.failure().is_none());
    assert_eq!(env.cloud.stats().insert_instance, 1);
}

#[tokio::test]
async fn test_running_machine_reports_internal_ip() {
    let env = Env::new(booting());
    env.publish_bootstrap("m1");
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());
    let ctx = Context::new();

    assert_ok!(r.reconcile(&ctx).await);
    env.cloud.set_internal_ip(PROJECT, ZONE, "m1", "10.0.0.5");
    while machine.get_instance_status() != InstanceStatus::Running {
        assert_ok!(r.reconcile(&ctx).await);
    }

    assert_eq!(
        machine.status().addresses,
        vec![NodeAddress::internal_ip("10.0.0.5")]
    );
}

#[tokio::test]
async fn test_terminated_machine_fails_and_is_not_recreated() {
    let env = Env::new(MemoryCloudConfig::default());
    env.publish_bootstrap("m1");
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());
    let ctx = Context::new();

    assert_ok!(r.reconcile(&ctx).await);
    assert_ok!(r.reconcile(&ctx).await);
    assert_eq!(machine.get_instance_status(), InstanceStatus::Running);

    env.cloud.remove_instance(PROJECT, ZONE, "m1");
    for _ in 0..3 {
        assert_ok!(r.reconcile(&ctx).await);
    }

    let failure = machine.failure().expect("failure recorded");
    assert_eq!(machine.get_instance_status(), InstanceStatus::Failed);
    assert_eq!(
        failure.reason,
        MachineStatusError::InstanceTerminatedUnexpectedly
    );
    assert!(!failure.message.is_empty());
    assert_eq!(env.cloud.stats().insert_instance, 1);
    assert!(env.cloud.instances().is_empty());
}

#[tokio::test]
async fn test_missing_bootstrap_data_requeues_without_mutation() {
    let env = Env::new(booting());
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());
    let pass = ReconcilePass::new().step("instance", &r);
    let ctx = Context::new();

    let outcome = pass.reconcile(&ctx).await;
    assert!(matches!(
        outcome.error,
        Some(CloudError::BootstrapDataUnavailable(_))
    ));
    assert_eq!(outcome.action, Action::Requeue(Duration::from_secs(15)));
    assert_eq!(machine.status(), MachineStatus::default());

    env.publish_bootstrap("m1");
    let outcome = pass.reconcile(&ctx).await;
    assert!(outcome.is_done());
    assert_eq!(machine.get_instance_status(), InstanceStatus::Provisioning);
}

#[tokio::test]
async fn test_status_survives_reload() {
    let env = Env::new(MemoryCloudConfig::default());
    env.publish_bootstrap("m1");
    let ctx = Context::new();

    let first = env.machine("m1");
    let r = InstanceReconciler::new(first.clone());
    assert_ok!(r.reconcile(&ctx).await);
    assert_ok!(r.reconcile(&ctx).await);

    // Persist and reload the way an orchestrating loop would.
    let stored = serde_json::to_string(&first.status()).unwrap();
    let status: MachineStatus = serde_json::from_str(&stored).unwrap();
    let reloaded = env.machine_with(first.spec().clone(), status.clone());

    let r = InstanceReconciler::new(reloaded.clone());
    assert_ok!(r.reconcile(&ctx).await);
    assert_eq!(reloaded.status(), status);
    assert_eq!(env.cloud.stats().insert_instance, 1);
}

#[tokio::test]
async fn test_delete_is_total_for_missing_instance() {
    let env = Env::new(MemoryCloudConfig::default());
    let machine = env.machine("never-created");
    let r = InstanceReconciler::new(machine.clone());

    for _ in 0..2 {
        assert_ok!(r.delete(&Context::new()).await);
    }
    assert_eq!(machine.status(), MachineStatus::default());
}

#[tokio::test]
async fn test_delete_after_backend_loss_finishes() {
    let env = Env::new(MemoryCloudConfig::default());
    env.publish_bootstrap("m1");
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());
    let ctx = Context::new();
    assert_ok!(r.reconcile(&ctx).await);

    env.cloud.remove_instance(PROJECT, ZONE, "m1");
    assert_ok!(r.delete(&ctx).await);
    assert_eq!(machine.get_instance_status(), InstanceStatus::Deleted);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded_mutates_nothing() {
    let env = Env::new(MemoryCloudConfig {
        latency: Duration::from_secs(10),
        ..Default::default()
    });
    env.publish_bootstrap("m1");
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());

    let ctx = Context::new().with_timeout(Duration::from_secs(1));
    let err = assert_err!(r.reconcile(&ctx).await);
    assert_eq!(err, CloudError::DeadlineExceeded);
    assert!(!err.is_terminal());
    assert_eq!(machine.status(), MachineStatus::default());
}

#[tokio::test]
async fn test_cancelled_pass_stops() {
    let env = Env::new(MemoryCloudConfig::default());
    env.publish_bootstrap("m1");
    let machine = env.machine("m1");
    let r = InstanceReconciler::new(machine.clone());
    let pass = ReconcilePass::new().step("instance", &r);

    let ctx = Context::new();
    ctx.cancel();
    let outcome = pass.reconcile(&ctx).await;

    assert_eq!(outcome.action, Action::Stop);
    assert_eq!(outcome.error, Some(CloudError::Cancelled));
    assert_eq!(machine.status(), MachineStatus::default());
    assert_eq!(env.cloud.stats().get_instance, 0);
}

#[tokio::test]
async fn test_invalid_machine_type_is_terminal() {
    let env = Env::new(MemoryCloudConfig::default());
    env.publish_bootstrap("m1");
    let mut spec = env.machine_spec("m1", capg_cloud::types::MachineRole::Worker);
    spec.machine_type.clear();
    let machine = env.machine_with(spec, MachineStatus::default());
    let r = InstanceReconciler::new(machine.clone());
    let pass = ReconcilePass::new().step("instance", &r);

    let outcome = pass.reconcile(&Context::new()).await;
    assert_eq!(outcome.action, Action::Stop);
    assert!(outcome.error.as_ref().is_some_and(CloudError::is_terminal));
    assert_eq!(
        machine.failure().map(|f| f.reason),
        Some(MachineStatusError::InvalidConfiguration)
    );
}
