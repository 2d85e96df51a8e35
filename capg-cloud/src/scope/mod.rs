//! Resource scopes - capability-typed views over one resource.
//!
//! Each resource exposes a read-only Getter and a status-only Setter. The full
//! capability (`Cluster`, `Machine`, `MachinePool`) is implemented for any
//! type that provides both halves, so a test double can implement just a
//! Getter for read-path tests.

pub mod cluster;
pub mod machine;
pub mod pool;

use async_trait::async_trait;

use crate::cloud::CloudHandle;
use crate::context::Context;
use crate::error::Result;
use crate::types::{
    ApiEndpoint, Failure, FailureDomains, InstanceStatus, Labels, MachineRole, MachineStatusError,
    NetworkStatus, NodeAddress,
};

pub use cluster::ClusterScope;
pub use machine::MachineScope;
pub use pool::{MachinePoolScope, PoolMember, ScalePlan};

/// Access to the shared cloud handle.
pub trait Client {
    fn cloud(&self) -> &CloudHandle;
}

// =============================================================================
// Cluster
// =============================================================================

/// Read-only view of a cluster. Accessors never perform I/O and never fail.
pub trait ClusterGetter: Client + Send + Sync {
    fn project(&self) -> &str;
    fn region(&self) -> &str;
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn network_name(&self) -> &str;
    /// Whether the network should create one subnetwork per region.
    fn auto_create_subnetworks(&self) -> bool;
    /// Observed network state.
    fn network(&self) -> NetworkStatus;
    fn additional_labels(&self) -> Labels;
    fn failure_domains(&self) -> FailureDomains;
    fn control_plane_endpoint(&self) -> Option<ApiEndpoint>;
}

/// Status mutations of a cluster.
pub trait ClusterSetter: Send + Sync {
    /// Record the control-plane endpoint.
    ///
    /// Re-setting the same endpoint is a no-op; any other endpoint once one is
    /// set fails with `EndpointConflict` and leaves the stored value intact.
    fn set_control_plane_endpoint(&self, endpoint: ApiEndpoint) -> Result<()>;

    /// Replace the observed network state.
    fn set_network_status(&self, network: NetworkStatus);
}

/// Full cluster capability.
pub trait Cluster: ClusterGetter + ClusterSetter {}

impl<T: ClusterGetter + ClusterSetter + ?Sized> Cluster for T {}

// =============================================================================
// Machine
// =============================================================================

/// Read-only view of a machine.
#[async_trait]
pub trait MachineGetter: Client + Send + Sync {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn cluster_name(&self) -> &str;
    fn zone(&self) -> &str;
    fn project(&self) -> &str;
    fn role(&self) -> &MachineRole;
    fn machine_type(&self) -> &str;
    fn image(&self) -> &str;
    fn additional_labels(&self) -> Labels;

    fn is_control_plane(&self) -> bool {
        self.role().is_control_plane()
    }

    fn control_plane_group_name(&self) -> Option<&str> {
        match self.role() {
            MachineRole::ControlPlane { group } => group.as_deref(),
            MachineRole::Worker => None,
        }
    }

    fn get_instance_id(&self) -> Option<String>;
    fn get_provider_id(&self) -> Option<String>;
    fn get_instance_status(&self) -> InstanceStatus;
    fn failure(&self) -> Option<Failure>;

    /// Fetch bootstrap data. Fails with `BootstrapDataUnavailable` until the
    /// bootstrap secret exists.
    async fn get_bootstrap_data(&self, ctx: &Context) -> Result<String>;
}

/// Status mutations of a machine.
pub trait MachineSetter: Send + Sync {
    /// Derive and store the provider ID from identity fields.
    fn set_provider_id(&self) -> Result<()>;

    fn set_instance_id(&self, id: &str);

    /// Move the instance status, enforcing the state machine.
    fn set_instance_status(&self, status: InstanceStatus) -> Result<()>;

    /// One half of the failure pair. Callers record failures through
    /// [`MachineSetter::record_failure`], which writes both halves together.
    fn set_failure_message(&self, message: String);

    /// One half of the failure pair; see [`MachineSetter::set_failure_message`].
    fn set_failure_reason(&self, reason: MachineStatusError);

    fn set_annotation(&self, key: &str, value: &str);

    /// Replace the whole address list.
    fn set_addresses(&self, addresses: Vec<NodeAddress>);

    /// Mark the machine failed with both reason and message. Nothing is
    /// written when the machine can not move to `Failed`.
    fn record_failure(&self, reason: MachineStatusError, message: String) -> Result<()> {
        self.set_instance_status(InstanceStatus::Failed)?;
        self.set_failure_reason(reason);
        self.set_failure_message(message);
        Ok(())
    }
}

/// Full machine capability.
pub trait Machine: MachineGetter + MachineSetter {}

impl<T: MachineGetter + MachineSetter + ?Sized> Machine for T {}

// =============================================================================
// MachinePool
// =============================================================================

/// Read-only view of a machine pool.
#[async_trait]
pub trait MachinePoolGetter: Client + Send + Sync {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn zone(&self) -> &str;
    /// Desired number of member machines.
    fn replicas(&self) -> u32;

    async fn get_bootstrap_data(&self, ctx: &Context) -> Result<String>;
}

/// Marker for the pool's mutation surface. A pool converges by adding and
/// removing member machines and has no fields of its own to write.
pub trait MachinePoolSetter {}

/// Full machine pool capability.
pub trait MachinePool: MachinePoolGetter + MachinePoolSetter {}

impl<T: MachinePoolGetter + MachinePoolSetter + ?Sized> MachinePool for T {}
