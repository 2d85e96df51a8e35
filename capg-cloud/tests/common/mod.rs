//! Test helpers for capg-cloud integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use capg_cloud::cloud::{CloudHandle, MemoryCloud, MemoryCloudConfig};
use capg_cloud::scope::{ClusterScope, MachinePoolScope, MachineScope};
use capg_cloud::types::{
    ClusterSpec, ClusterStatus, FailureDomain, Labels, MachinePoolSpec, MachineRole, MachineSpec,
    MachineStatus, NetworkSpec,
};
use capg_cloud::StaticBootstrap;

pub const PROJECT: &str = "acme";
pub const REGION: &str = "us-east1";
pub const ZONE: &str = "us-east1-b";
pub const CLUSTER: &str = "prod";
pub const NAMESPACE: &str = "default";

/// One in-memory backend plus the bootstrap secrets scopes read from.
pub struct Env {
    pub cloud: Arc<MemoryCloud>,
    pub handle: CloudHandle,
    pub bootstrap: Arc<StaticBootstrap>,
}

impl Env {
    pub fn new(config: MemoryCloudConfig) -> Self {
        let cloud = Arc::new(MemoryCloud::new(config));
        Self {
            handle: CloudHandle::new(cloud.clone(), "integration-test"),
            cloud,
            bootstrap: Arc::new(StaticBootstrap::new()),
        }
    }

    pub fn cluster_spec(&self) -> ClusterSpec {
        let mut failure_domains = BTreeMap::new();
        for zone in ["us-east1-b", "us-east1-c"] {
            failure_domains.insert(
                zone.to_string(),
                FailureDomain {
                    control_plane: true,
                    ..Default::default()
                },
            );
        }
        ClusterSpec {
            name: CLUSTER.into(),
            namespace: NAMESPACE.into(),
            project: PROJECT.into(),
            region: REGION.into(),
            network: NetworkSpec {
                name: Some(format!("{}-net", CLUSTER)),
                auto_create_subnetworks: true,
            },
            additional_labels: Labels::new(),
            failure_domains,
            control_plane_endpoint: None,
        }
    }

    pub fn cluster(&self) -> Arc<ClusterScope> {
        Arc::new(ClusterScope::new(
            self.cluster_spec(),
            ClusterStatus::default(),
            self.handle.clone(),
        ))
    }

    pub fn machine_spec(&self, name: &str, role: MachineRole) -> MachineSpec {
        MachineSpec {
            name: name.into(),
            namespace: NAMESPACE.into(),
            cluster_name: CLUSTER.into(),
            project: PROJECT.into(),
            zone: ZONE.into(),
            role,
            machine_type: "n2-standard-4".into(),
            image: "capi-ubuntu-2204".into(),
            bootstrap_secret: Some(format!("{}-bootstrap", name)),
            additional_labels: Labels::new(),
        }
    }

    pub fn machine_with(&self, spec: MachineSpec, status: MachineStatus) -> Arc<MachineScope> {
        Arc::new(MachineScope::new(
            spec,
            status,
            self.handle.clone(),
            self.bootstrap.clone(),
        ))
    }

    pub fn machine(&self, name: &str) -> Arc<MachineScope> {
        self.machine_with(
            self.machine_spec(name, MachineRole::Worker),
            MachineStatus::default(),
        )
    }

    pub fn control_plane(&self, name: &str) -> Arc<MachineScope> {
        let role = MachineRole::ControlPlane {
            group: Some(format!("{}-cp", CLUSTER)),
        };
        self.machine_with(self.machine_spec(name, role), MachineStatus::default())
    }

    /// Make bootstrap data available for a machine built by this env.
    pub fn publish_bootstrap(&self, name: &str) {
        self.bootstrap
            .insert(NAMESPACE, &format!("{}-bootstrap", name), "#cloud-config");
    }

    pub fn pool(&self, name: &str, replicas: u32) -> Arc<MachinePoolScope> {
        let spec = MachinePoolSpec {
            name: name.into(),
            namespace: NAMESPACE.into(),
            cluster_name: CLUSTER.into(),
            project: PROJECT.into(),
            zone: ZONE.into(),
            replicas,
            machine_type: "e2-standard-4".into(),
            image: "capi-ubuntu-2204".into(),
            bootstrap_secret: Some(format!("{}-bootstrap", name)),
            additional_labels: Labels::new(),
        };
        Arc::new(MachinePoolScope::new(
            spec,
            self.handle.clone(),
            self.bootstrap.clone(),
        ))
    }
}
