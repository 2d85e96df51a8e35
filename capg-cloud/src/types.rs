//! Data model shared by scopes and reconcilers.
//!
//! Spec types describe desired state as loaded from storage; status types
//! carry observed state that setters mutate and the orchestrating loop
//! writes back under the same (namespace, name) key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// API group of the infrastructure types.
pub const GROUP: &str = "infrastructure.cluster.x-k8s.io";
/// API version of the infrastructure types.
pub const VERSION: &str = "v1beta1";

/// Group/version tag attached to persisted records.
///
/// Registration into a scheme belongs to the persistence layer; the core only
/// exposes the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    pub group: &'static str,
    pub version: &'static str,
}

impl GroupVersion {
    /// The `apiVersion` string, e.g. `infrastructure.cluster.x-k8s.io/v1beta1`.
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

pub const GROUP_VERSION: GroupVersion = GroupVersion {
    group: GROUP,
    version: VERSION,
};

/// Free-form key/value labels applied to backend resources.
pub type Labels = BTreeMap<String, String>;

/// Label key marking backend resources owned by a cluster.
pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("capg-cluster-{}", cluster_name)
}

/// Value stored under [`cluster_tag_key`] for owned resources.
pub const RESOURCE_LIFECYCLE_OWNED: &str = "owned";

/// Annotation set on machines once the backend instance has been observed.
pub const INSTANCE_ANNOTATION: &str = "cluster-api-provider-gcp";

// =============================================================================
// Cluster
// =============================================================================

/// Host and port of the control-plane API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

impl ApiEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// An endpoint with an empty host or port 0 is treated as unset.
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() || self.port == 0
    }
}

impl fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A named fault-isolation zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDomain {
    /// Whether control-plane machines may be placed here.
    pub control_plane: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Failure domains keyed by zone name.
pub type FailureDomains = BTreeMap<String, FailureDomain>;

/// Desired VPC network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name; defaults to "default" when unset.
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub auto_create_subnetworks: bool,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: None,
            auto_create_subnetworks: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Observed network state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub self_link: Option<String>,
    /// Address reserved for the control-plane API server.
    pub api_server_address: Option<String>,
}

/// Desired state of a cluster as loaded from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub namespace: String,
    pub project: String,
    pub region: String,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub additional_labels: Labels,
    #[serde(default)]
    pub failure_domains: FailureDomains,
    /// User-supplied endpoint; when set the address reconciler only verifies it.
    #[serde(default)]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

/// Observed state of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub control_plane_endpoint: Option<ApiEndpoint>,
    pub network: NetworkStatus,
    pub ready: bool,
}

// =============================================================================
// Machine
// =============================================================================

/// Role of a machine in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineRole {
    ControlPlane {
        /// Instance group control-plane members are registered in.
        group: Option<String>,
    },
    Worker,
}

impl MachineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineRole::ControlPlane { .. } => "control-plane",
            MachineRole::Worker => "node",
        }
    }

    pub fn is_control_plane(&self) -> bool {
        matches!(self, MachineRole::ControlPlane { .. })
    }
}

/// Lifecycle of the backend instance as seen by the machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Not observed yet.
    #[default]
    Unknown,
    Provisioning,
    Running,
    /// Terminal; the machine must be deleted and recreated.
    Failed,
    Deleting,
    Deleted,
}

impl InstanceStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-setting the current status is always allowed.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (Deleted, _) => false,
            (_, Failed) => true,
            (Unknown, Provisioning | Running | Deleting) => true,
            (Provisioning, Running | Deleting) => true,
            (Running, Deleting) => true,
            (Failed, Deleting) => true,
            (Deleting, Deleted) => true,
            _ => false,
        }
    }

    /// `Failed` and `Deleted` never lead back to a live state.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Failed | InstanceStatus::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Unknown => "Unknown",
            InstanceStatus::Provisioning => "Provisioning",
            InstanceStatus::Running => "Running",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Deleting => "Deleting",
            InstanceStatus::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a machine network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Hostname,
    InternalIP,
    ExternalIP,
    InternalDNS,
    ExternalDNS,
}

/// A network address reported for a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

impl NodeAddress {
    pub fn internal_ip(address: impl Into<String>) -> Self {
        Self {
            address_type: AddressType::InternalIP,
            address: address.into(),
        }
    }

    pub fn external_ip(address: impl Into<String>) -> Self {
        Self {
            address_type: AddressType::ExternalIP,
            address: address.into(),
        }
    }
}

/// Terminal machine failure reasons surfaced to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineStatusError {
    InvalidConfiguration,
    UnsupportedChange,
    InsufficientResources,
    CreateMachine,
    UpdateMachine,
    DeleteMachine,
    InstanceTerminatedUnexpectedly,
}

impl MachineStatusError {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineStatusError::InvalidConfiguration => "InvalidConfiguration",
            MachineStatusError::UnsupportedChange => "UnsupportedChange",
            MachineStatusError::InsufficientResources => "InsufficientResources",
            MachineStatusError::CreateMachine => "CreateError",
            MachineStatusError::UpdateMachine => "UpdateError",
            MachineStatusError::DeleteMachine => "DeleteError",
            MachineStatusError::InstanceTerminatedUnexpectedly => {
                "InstanceTerminatedUnexpectedly"
            }
        }
    }
}

impl fmt::Display for MachineStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded terminal failure. Only ever produced with both halves present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: MachineStatusError,
    pub message: String,
}

/// Desired state of a machine as loaded from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub project: String,
    /// Zone (failure domain) the instance is placed in.
    pub zone: String,
    pub role: MachineRole,
    pub machine_type: String,
    pub image: String,
    /// Name of the secret holding bootstrap data; unset until the bootstrap
    /// provider has produced it.
    #[serde(default)]
    pub bootstrap_secret: Option<String>,
    #[serde(default)]
    pub additional_labels: Labels,
}

/// Observed state of a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub instance_id: Option<String>,
    pub provider_id: Option<String>,
    pub instance_status: InstanceStatus,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    pub failure_reason: Option<MachineStatusError>,
    pub failure_message: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl MachineStatus {
    /// The recorded failure, if both reason and message are present.
    pub fn failure(&self) -> Option<Failure> {
        match (&self.failure_reason, &self.failure_message) {
            (Some(reason), Some(message)) => Some(Failure {
                reason: *reason,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// MachinePool
// =============================================================================

/// Desired state of a machine pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinePoolSpec {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub project: String,
    pub zone: String,
    pub replicas: u32,
    pub machine_type: String,
    pub image: String,
    #[serde(default)]
    pub bootstrap_secret: Option<String>,
    #[serde(default)]
    pub additional_labels: Labels,
}
