//! Simulated orchestrating loop.
//!
//! Holds the stored spec and status of one cluster and its machines, rebuilds
//! scopes from them every pass, runs the reconcilers and writes the observed
//! status back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use capg_cloud::cloud::{CloudHandle, MemoryCloud, MemoryCloudConfig};
use capg_cloud::types::{
    ClusterSpec, ClusterStatus, FailureDomain, InstanceStatus, Labels, MachineRole, MachineSpec,
    MachineStatus, NetworkSpec,
};
use capg_cloud::{
    Action, ClusterScope, Context, ControlPlaneAddressReconciler, InstanceReconciler,
    MachineScope, NetworkReconciler, PassOutcome, ReconcilePass, StaticBootstrap,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub cluster: String,
    pub namespace: String,
    pub project: String,
    pub region: String,
    pub network: Option<String>,
    pub zones: Vec<String>,
    pub replicas: u32,
    pub machine_type: String,
    pub image: String,
    pub passes: usize,
    pub interval: Duration,
    pub timeout: Duration,
    pub port: u16,
    /// Bootstrap secrets appear at the start of this pass.
    pub bootstrap_delay_passes: usize,
    /// Terminate the first worker's instance before this pass.
    pub terminate_after_passes: Option<usize>,
    /// Give the project one instance less quota than the cluster needs.
    pub quota_exceeded: bool,
    /// Delete everything after the reconcile passes.
    pub teardown: bool,
}

/// Stored state of one machine.
struct StoredMachine {
    spec: MachineSpec,
    status: MachineStatus,
}

#[derive(Debug, Serialize)]
pub struct MachineReport {
    pub namespace: String,
    pub name: String,
    pub zone: String,
    pub role: MachineRole,
    pub status: MachineStatus,
}

/// Final state printed by the binary.
#[derive(Debug, Serialize)]
pub struct Report {
    pub cluster: String,
    pub passes: usize,
    pub converged: bool,
    pub status: ClusterStatus,
    pub machines: Vec<MachineReport>,
}

pub struct Simulator {
    config: SimConfig,
    cloud: Arc<MemoryCloud>,
    handle: CloudHandle,
    bootstrap: Arc<StaticBootstrap>,
    cluster_spec: ClusterSpec,
    cluster_status: ClusterStatus,
    machines: BTreeMap<(String, String), StoredMachine>,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        let machine_count = config.replicas as usize + 1;
        let cloud = Arc::new(MemoryCloud::new(MemoryCloudConfig {
            boot_polls: 1,
            delete_polls: 1,
            instance_quota: config
                .quota_exceeded
                .then(|| machine_count.saturating_sub(1)),
            ..Default::default()
        }));
        let handle = CloudHandle::new(cloud.clone(), format!("sim:{}", config.project));

        let failure_domains = config
            .zones
            .iter()
            .map(|zone| {
                (
                    zone.clone(),
                    FailureDomain {
                        control_plane: true,
                        ..Default::default()
                    },
                )
            })
            .collect();

        let cluster_spec = ClusterSpec {
            name: config.cluster.clone(),
            namespace: config.namespace.clone(),
            project: config.project.clone(),
            region: config.region.clone(),
            network: NetworkSpec {
                name: config.network.clone(),
                auto_create_subnetworks: true,
            },
            additional_labels: Labels::new(),
            failure_domains,
            control_plane_endpoint: None,
        };

        let mut sim = Self {
            cloud,
            handle,
            bootstrap: Arc::new(StaticBootstrap::new()),
            cluster_spec,
            cluster_status: ClusterStatus::default(),
            machines: BTreeMap::new(),
            config,
        };
        sim.load_machines();
        sim
    }

    /// One control-plane machine plus `replicas` workers spread across zones.
    fn load_machines(&mut self) {
        let cluster = self.config.cluster.clone();
        let zones = self.config.zones.clone();
        let replicas = self.config.replicas as usize;
        let mut add = |name: String, zone: &str, role: MachineRole| {
            let spec = MachineSpec {
                name: name.clone(),
                namespace: self.config.namespace.clone(),
                cluster_name: cluster.clone(),
                project: self.config.project.clone(),
                zone: zone.to_string(),
                role,
                machine_type: self.config.machine_type.clone(),
                image: self.config.image.clone(),
                bootstrap_secret: Some(format!("{}-bootstrap", name)),
                additional_labels: Labels::new(),
            };
            self.machines.insert(
                (self.config.namespace.clone(), name),
                StoredMachine {
                    spec,
                    status: MachineStatus::default(),
                },
            );
        };

        let first = zones.first().map(String::as_str).unwrap_or_default();
        add(
            format!("{}-control-plane-0", cluster),
            first,
            MachineRole::ControlPlane {
                group: Some(format!("{}-control-plane", cluster)),
            },
        );
        for i in 0..replicas {
            let zone = &zones[i % zones.len()];
            add(format!("{}-md-{}", cluster, i), zone, MachineRole::Worker);
        }
    }

    fn publish_bootstrap(&self) {
        for stored in self.machines.values() {
            if let Some(secret) = &stored.spec.bootstrap_secret {
                self.bootstrap
                    .insert(&stored.spec.namespace, secret, "#cloud-config\nruncmd: []\n");
            }
        }
    }

    fn inject_faults(&self, pass: usize) {
        if pass == self.config.bootstrap_delay_passes {
            info!(pass, "Publishing bootstrap secrets");
            self.publish_bootstrap();
        }
        if self.config.terminate_after_passes == Some(pass) {
            let worker = self
                .machines
                .values()
                .find(|m| !m.spec.role.is_control_plane());
            if let Some(m) = worker {
                warn!(pass, machine = %m.spec.name, "Terminating instance behind the controller's back");
                self.cloud
                    .terminate_instance(&m.spec.project, &m.spec.zone, &m.spec.name);
            }
        }
    }

    fn cluster_scope(&self) -> Arc<ClusterScope> {
        Arc::new(ClusterScope::new(
            self.cluster_spec.clone(),
            self.cluster_status.clone(),
            self.handle.clone(),
        ))
    }

    fn machine_scope(&self, stored: &StoredMachine) -> Arc<MachineScope> {
        Arc::new(MachineScope::new(
            stored.spec.clone(),
            stored.status.clone(),
            self.handle.clone(),
            self.bootstrap.clone(),
        ))
    }

    /// Run the configured passes, then tear down if asked to. Stops early when
    /// `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<Report> {
        let root = Context::with_token(shutdown.clone());
        let mut passes = 0;
        let mut converged = false;

        for pass in 0..self.config.passes {
            if shutdown.is_cancelled() {
                break;
            }
            self.inject_faults(pass);

            let ctx = root.child().with_timeout(self.config.timeout);
            converged = self.reconcile_pass(pass, &ctx).await;
            passes += 1;

            if !self.wait(&shutdown).await {
                break;
            }
        }

        if self.config.teardown && !shutdown.is_cancelled() {
            for pass in 0..self.config.passes {
                let ctx = root.child().with_timeout(self.config.timeout);
                passes += 1;
                if self.delete_pass(pass, &ctx).await {
                    info!(pass, "Teardown complete");
                    break;
                }
                if !self.wait(&shutdown).await {
                    break;
                }
            }
        }

        Ok(self.report(passes, converged))
    }

    /// Sleep between passes; false when shutdown fired first.
    async fn wait(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.interval) => true,
        }
    }

    async fn reconcile_pass(&mut self, pass: usize, ctx: &Context) -> bool {
        let cluster = self.cluster_scope();
        let network = NetworkReconciler::new(cluster.clone());
        let address =
            ControlPlaneAddressReconciler::new(cluster.clone()).with_port(self.config.port);
        let outcome = ReconcilePass::new()
            .step("network", &network)
            .step("control-plane-address", &address)
            .reconcile(ctx)
            .await;
        self.cluster_status = cluster.status();
        if !log_outcome(pass, &self.config.cluster, &outcome) {
            return false;
        }

        let mut converged = true;
        let mut control_plane_ready = false;
        let keys: Vec<_> = self.machines.keys().cloned().collect();
        for key in keys {
            let Some(stored) = self.machines.get(&key) else {
                continue;
            };
            let scope = self.machine_scope(stored);
            let instance = InstanceReconciler::new(scope.clone());
            let outcome = ReconcilePass::new()
                .step("instance", &instance)
                .reconcile(ctx)
                .await;
            let Some(stored) = self.machines.get_mut(&key) else {
                continue;
            };
            stored.status = scope.status();

            let running = stored.status.instance_status == InstanceStatus::Running;
            if stored.spec.role.is_control_plane() && running {
                control_plane_ready = true;
            }
            converged &= log_outcome(pass, &stored.spec.name, &outcome) && running;
            if ctx.is_cancelled() {
                return false;
            }
        }

        cluster.set_ready(control_plane_ready && cluster.status().control_plane_endpoint.is_some());
        self.cluster_status = cluster.status();
        converged
    }

    /// One teardown pass; true once everything is gone.
    async fn delete_pass(&mut self, pass: usize, ctx: &Context) -> bool {
        let mut machines_gone = true;
        let keys: Vec<_> = self.machines.keys().cloned().collect();
        for key in keys {
            let Some(stored) = self.machines.get(&key) else {
                continue;
            };
            let scope = self.machine_scope(stored);
            let instance = InstanceReconciler::new(scope.clone());
            let outcome = ReconcilePass::new()
                .step("instance", &instance)
                .delete(ctx)
                .await;
            if let Some(stored) = self.machines.get_mut(&key) {
                stored.status = scope.status();
            }
            machines_gone &= log_outcome(pass, &key.1, &outcome);
        }
        if !machines_gone {
            return false;
        }

        let cluster = self.cluster_scope();
        cluster.set_ready(false);
        let network = NetworkReconciler::new(cluster.clone());
        let address = ControlPlaneAddressReconciler::new(cluster.clone());
        let outcome = ReconcilePass::new()
            .step("network", &network)
            .step("control-plane-address", &address)
            .delete(ctx)
            .await;
        self.cluster_status = cluster.status();
        log_outcome(pass, &self.config.cluster, &outcome)
    }

    fn report(&self, passes: usize, converged: bool) -> Report {
        Report {
            cluster: self.config.cluster.clone(),
            passes,
            converged,
            status: self.cluster_status.clone(),
            machines: self
                .machines
                .iter()
                .map(|((namespace, name), stored)| MachineReport {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    zone: stored.spec.zone.clone(),
                    role: stored.spec.role.clone(),
                    status: stored.status.clone(),
                })
                .collect(),
        }
    }
}

/// Log a resource's pass outcome; true when it finished cleanly.
fn log_outcome(pass: usize, resource: &str, outcome: &PassOutcome) -> bool {
    match (&outcome.action, &outcome.error) {
        (Action::Done, _) => true,
        (Action::Requeue(after), Some(err)) => {
            info!(pass, resource, error = %err, ?after, "Requeued");
            false
        }
        (Action::Stop, Some(err)) => {
            warn!(pass, resource, error = %err, "Stopped");
            false
        }
        _ => false,
    }
}
