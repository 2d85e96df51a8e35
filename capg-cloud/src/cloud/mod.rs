//! Cloud handle - the backend API reconcilers talk to.
//!
//! The [`Cloud`] trait is the only way reconcilers reach the backend:
//! - networks: VPCs owned by a cluster
//! - addresses: regional addresses reserved for control-plane endpoints
//! - instances: compute instances backing machines
//!
//! A concrete SDK binding implements [`Cloud`]; [`MemoryCloud`] is the
//! in-process implementation used by tests and the simulator.

pub mod memory;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Labels;

pub use memory::{MemoryCloud, MemoryCloudConfig};

/// Instance state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendInstanceState {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Suspended,
    Terminated,
}

impl fmt::Display for BackendInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendInstanceState::Provisioning => "PROVISIONING",
            BackendInstanceState::Staging => "STAGING",
            BackendInstanceState::Running => "RUNNING",
            BackendInstanceState::Stopping => "STOPPING",
            BackendInstanceState::Stopped => "STOPPED",
            BackendInstanceState::Suspended => "SUSPENDED",
            BackendInstanceState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub state: BackendInstanceState,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub machine_type: String,
    pub image: String,
    pub labels: Labels,
    /// Instance metadata; bootstrap data travels under `user-data`.
    pub metadata: Labels,
}

/// A VPC network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub self_link: String,
    pub auto_create_subnetworks: bool,
    pub labels: Labels,
}

/// Parameters for creating a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub name: String,
    pub auto_create_subnetworks: bool,
    pub labels: Labels,
}

/// A reserved regional address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub region: String,
    pub address: String,
}

/// Backend infrastructure API.
///
/// Lookups return `Ok(None)` for absent resources; `insert_*` returns
/// `AlreadyExists` and `delete_*` returns `NotFound` so callers can treat
/// both as converged. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>>;

    async fn insert_network(&self, project: &str, req: NetworkRequest) -> Result<Network>;

    async fn delete_network(&self, project: &str, name: &str) -> Result<()>;

    async fn get_address(&self, project: &str, region: &str, name: &str)
    -> Result<Option<Address>>;

    async fn insert_address(&self, project: &str, region: &str, name: &str) -> Result<Address>;

    async fn delete_address(&self, project: &str, region: &str, name: &str) -> Result<()>;

    async fn get_instance(&self, project: &str, zone: &str, name: &str)
    -> Result<Option<Instance>>;

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        req: InstanceRequest,
    ) -> Result<Instance>;

    /// Start deleting an instance. Completion is observed via `get_instance`.
    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<()>;
}

/// Shared, immutable handle to an authenticated backend connection.
///
/// Built once per reconciliation pass and cloned into every scope; clones
/// share the same connection.
#[derive(Clone)]
pub struct CloudHandle {
    api: Arc<dyn Cloud>,
    credentials: Arc<str>,
}

impl CloudHandle {
    pub fn new(api: Arc<dyn Cloud>, credentials: impl Into<Arc<str>>) -> Self {
        Self {
            api,
            credentials: credentials.into(),
        }
    }

    /// Label of the credentials this handle authenticates with.
    pub fn credentials(&self) -> &str {
        &self.credentials
    }
}

impl Deref for CloudHandle {
    type Target = dyn Cloud;

    fn deref(&self) -> &Self::Target {
        self.api.as_ref()
    }
}

impl fmt::Debug for CloudHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudHandle")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}
