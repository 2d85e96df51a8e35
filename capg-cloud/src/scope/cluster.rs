//! Cluster scope backed by a loaded spec and status.

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{Client, ClusterGetter, ClusterSetter};
use crate::cloud::CloudHandle;
use crate::error::{CloudError, Result};
use crate::types::{
    ApiEndpoint, ClusterSpec, ClusterStatus, FailureDomains, Labels, NetworkStatus,
    RESOURCE_LIFECYCLE_OWNED, cluster_tag_key,
};

const DEFAULT_NETWORK_NAME: &str = "default";

/// In-memory view of one cluster for the duration of a pass.
pub struct ClusterScope {
    spec: ClusterSpec,
    status: RwLock<ClusterStatus>,
    cloud: CloudHandle,
}

impl ClusterScope {
    /// Build a scope from stored spec and status.
    ///
    /// A user-supplied endpoint in `ClusterSpec` seeds the status when the status
    /// has none yet.
    pub fn new(spec: ClusterSpec, mut status: ClusterStatus, cloud: CloudHandle) -> Self {
        if status.control_plane_endpoint.is_none() {
            status.control_plane_endpoint = spec
                .control_plane_endpoint
                .clone()
                .filter(|e| !e.is_zero());
        }
        Self {
            spec,
            status: RwLock::new(status),
            cloud,
        }
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Snapshot of the observed state, for the loop to persist.
    pub fn status(&self) -> ClusterStatus {
        self.status.read().clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.status.write().ready = ready;
    }
}

impl Client for ClusterScope {
    fn cloud(&self) -> &CloudHandle {
        &self.cloud
    }
}

impl ClusterGetter for ClusterScope {
    fn project(&self) -> &str {
        &self.spec.project
    }

    fn region(&self) -> &str {
        &self.spec.region
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    fn network_name(&self) -> &str {
        self.spec
            .network
            .name
            .as_deref()
            .unwrap_or(DEFAULT_NETWORK_NAME)
    }

    fn auto_create_subnetworks(&self) -> bool {
        self.spec.network.auto_create_subnetworks
    }

    fn network(&self) -> NetworkStatus {
        self.status.read().network.clone()
    }

    /// User labels plus the cluster ownership label.
    fn additional_labels(&self) -> Labels {
        let mut labels = self.spec.additional_labels.clone();
        labels.insert(
            cluster_tag_key(&self.spec.name),
            RESOURCE_LIFECYCLE_OWNED.to_string(),
        );
        labels
    }

    fn failure_domains(&self) -> FailureDomains {
        self.spec.failure_domains.clone()
    }

    fn control_plane_endpoint(&self) -> Option<ApiEndpoint> {
        self.status.read().control_plane_endpoint.clone()
    }
}

impl ClusterSetter for ClusterScope {
    fn set_control_plane_endpoint(&self, endpoint: ApiEndpoint) -> Result<()> {
        if endpoint.is_zero() {
            return Err(CloudError::InvalidConfiguration(format!(
                "cluster {}: control plane endpoint {:?} is incomplete",
                self.spec.name, endpoint
            )));
        }

        let mut status = self.status.write();
        match &status.control_plane_endpoint {
            Some(current) if *current == endpoint => {
                debug!(cluster = %self.spec.name, endpoint = %endpoint, "Control plane endpoint unchanged");
                Ok(())
            }
            Some(current) => Err(CloudError::EndpointConflict {
                current: current.to_string(),
                requested: endpoint.to_string(),
            }),
            None => {
                info!(cluster = %self.spec.name, endpoint = %endpoint, "Control plane endpoint set");
                status.control_plane_endpoint = Some(endpoint);
                Ok(())
            }
        }
    }

    fn set_network_status(&self, network: NetworkStatus) {
        self.status.write().network = network;
    }
}
