//! In-memory cloud backend.
//!
//! Models the parts of a real backend reconcilers care about: asynchronous
//! boot and teardown, quota, conflicting inserts, and injected faults.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Address, BackendInstanceState, Cloud, Instance, InstanceRequest, Network, NetworkRequest,
};
use crate::error::{CloudError, Result};

/// Behaviour knobs for [`MemoryCloud`].
#[derive(Debug, Clone)]
pub struct MemoryCloudConfig {
    /// Number of `get_instance` observations that still report a new
    /// instance as booting.
    pub boot_polls: u32,
    /// Number of `get_instance` observations that still report a deleted
    /// instance as stopping.
    pub delete_polls: u32,
    /// Maximum instances per project; `None` is unlimited.
    pub instance_quota: Option<usize>,
    /// Artificial latency added to every call.
    pub latency: Duration,
}

impl Default for MemoryCloudConfig {
    fn default() -> Self {
        Self {
            boot_polls: 0,
            delete_polls: 0,
            instance_quota: None,
            latency: Duration::ZERO,
        }
    }
}

/// Per-operation call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub get_instance: u32,
    pub insert_instance: u32,
    pub delete_instance: u32,
    pub insert_network: u32,
    pub delete_network: u32,
    pub insert_address: u32,
    pub delete_address: u32,
}

struct InstanceEntry {
    instance: Instance,
    boot_polls_left: u32,
    delete_polls_left: Option<u32>,
}

#[derive(Default)]
struct State {
    networks: BTreeMap<(String, String), Network>,
    addresses: BTreeMap<(String, String, String), Address>,
    instances: BTreeMap<(String, String, String), InstanceEntry>,
    injected: VecDeque<CloudError>,
    next_host: u32,
    next_address: u32,
    stats: CallStats,
}

fn key2(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

fn key3(a: &str, b: &str, c: &str) -> (String, String, String) {
    (a.to_string(), b.to_string(), c.to_string())
}

/// Cloud backend held entirely in process memory.
pub struct MemoryCloud {
    config: MemoryCloudConfig,
    state: Mutex<State>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new(MemoryCloudConfig::default())
    }
}

impl MemoryCloud {
    pub fn new(config: MemoryCloudConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                // .0 and .1 are reserved by the subnet
                next_host: 2,
                ..Default::default()
            }),
        }
    }

    /// Fail the next call (of any kind) with `err`.
    pub fn inject_error(&self, err: CloudError) {
        self.state.lock().injected.push_back(err);
    }

    /// Simulate the backend stopping an instance on its own.
    pub fn terminate_instance(&self, project: &str, zone: &str, name: &str) -> bool {
        let mut state = self.state.lock();
        match state.instances.get_mut(&key3(project, zone, name)) {
            Some(entry) => {
                entry.instance.state = BackendInstanceState::Terminated;
                true
            }
            None => false,
        }
    }

    /// Simulate an instance vanishing without going through `delete_instance`.
    pub fn remove_instance(&self, project: &str, zone: &str, name: &str) -> bool {
        self.state
            .lock()
            .instances
            .remove(&key3(project, zone, name))
            .is_some()
    }

    /// Override the internal IP assigned to an instance.
    pub fn set_internal_ip(&self, project: &str, zone: &str, name: &str, ip: &str) -> bool {
        let mut state = self.state.lock();
        match state.instances.get_mut(&key3(project, zone, name)) {
            Some(entry) => {
                entry.instance.internal_ip = Some(ip.to_string());
                true
            }
            None => false,
        }
    }

    pub fn instance(&self, project: &str, zone: &str, name: &str) -> Option<Instance> {
        self.state
            .lock()
            .instances
            .get(&key3(project, zone, name))
            .map(|e| e.instance.clone())
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state
            .lock()
            .instances
            .values()
            .map(|e| e.instance.clone())
            .collect()
    }

    pub fn network(&self, project: &str, name: &str) -> Option<Network> {
        self.state.lock().networks.get(&key2(project, name)).cloned()
    }

    pub fn address(&self, project: &str, region: &str, name: &str) -> Option<Address> {
        self.state
            .lock()
            .addresses
            .get(&key3(project, region, name))
            .cloned()
    }

    pub fn stats(&self) -> CallStats {
        self.state.lock().stats.clone()
    }

    /// Apply latency, then surface an injected fault if one is queued.
    async fn enter(&self, op: &str) -> Result<()> {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        if let Some(err) = self.state.lock().injected.pop_front() {
            debug!(op, error = %err, "Injected fault");
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl Cloud for MemoryCloud {
    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>> {
        self.enter("get_network").await?;
        Ok(self.network(project, name))
    }

    async fn insert_network(&self, project: &str, req: NetworkRequest) -> Result<Network> {
        self.enter("insert_network").await?;
        let mut state = self.state.lock();
        state.stats.insert_network += 1;

        let key = key2(project, &req.name);
        if state.networks.contains_key(&key) {
            return Err(CloudError::AlreadyExists(format!("network {}", req.name)));
        }

        let network = Network {
            self_link: format!(
                "https://www.googleapis.com/compute/v1/projects/{}/global/networks/{}",
                project, req.name
            ),
            name: req.name,
            auto_create_subnetworks: req.auto_create_subnetworks,
            labels: req.labels,
        };
        state.networks.insert(key, network.clone());
        Ok(network)
    }

    async fn delete_network(&self, project: &str, name: &str) -> Result<()> {
        self.enter("delete_network").await?;
        let mut state = self.state.lock();
        state.stats.delete_network += 1;
        match state.networks.remove(&key2(project, name)) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(format!("network {}", name))),
        }
    }

    async fn get_address(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Option<Address>> {
        self.enter("get_address").await?;
        Ok(self.address(project, region, name))
    }

    async fn insert_address(&self, project: &str, region: &str, name: &str) -> Result<Address> {
        self.enter("insert_address").await?;
        let mut state = self.state.lock();
        state.stats.insert_address += 1;

        let key = key3(project, region, name);
        if state.addresses.contains_key(&key) {
            return Err(CloudError::AlreadyExists(format!("address {}", name)));
        }

        state.next_address += 1;
        let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(34, 120, 0, 0)) + state.next_address);
        let address = Address {
            name: name.to_string(),
            region: region.to_string(),
            address: ip.to_string(),
        };
        state.addresses.insert(key, address.clone());
        Ok(address)
    }

    async fn delete_address(&self, project: &str, region: &str, name: &str) -> Result<()> {
        self.enter("delete_address").await?;
        let mut state = self.state.lock();
        state.stats.delete_address += 1;
        match state.addresses.remove(&key3(project, region, name)) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(format!("address {}", name))),
        }
    }

    async fn get_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<Instance>> {
        self.enter("get_instance").await?;
        let mut state = self.state.lock();
        state.stats.get_instance += 1;

        let key = key3(project, zone, name);
        let Some(entry) = state.instances.get_mut(&key) else {
            return Ok(None);
        };

        if let Some(left) = entry.delete_polls_left {
            if left == 0 {
                state.instances.remove(&key);
                return Ok(None);
            }
            entry.delete_polls_left = Some(left - 1);
            return Ok(Some(entry.instance.clone()));
        }

        if matches!(
            entry.instance.state,
            BackendInstanceState::Provisioning | BackendInstanceState::Staging
        ) {
            if entry.boot_polls_left == 0 {
                entry.instance.state = BackendInstanceState::Running;
            } else {
                entry.boot_polls_left -= 1;
                entry.instance.state = BackendInstanceState::Staging;
            }
        }

        Ok(Some(entry.instance.clone()))
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        req: InstanceRequest,
    ) -> Result<Instance> {
        self.enter("insert_instance").await?;
        let mut state = self.state.lock();
        state.stats.insert_instance += 1;

        if req.machine_type.is_empty() {
            return Err(CloudError::InvalidConfiguration(format!(
                "instance {}: machine type is required",
                req.name
            )));
        }
        if req.image.is_empty() {
            return Err(CloudError::InvalidConfiguration(format!(
                "instance {}: source image is required",
                req.name
            )));
        }

        let key = key3(project, zone, &req.name);
        if state.instances.contains_key(&key) {
            return Err(CloudError::AlreadyExists(format!("instance {}", req.name)));
        }

        if let Some(quota) = self.config.instance_quota {
            let used = state
                .instances
                .keys()
                .filter(|(p, _, _)| p == project)
                .count();
            if used >= quota {
                return Err(CloudError::QuotaExceeded(format!(
                    "INSTANCES quota of {} exceeded in project {}",
                    quota, project
                )));
            }
        }

        let host = state.next_host;
        state.next_host += 1;
        let internal_ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) + host);

        let instance = Instance {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name,
            zone: zone.to_string(),
            machine_type: req.machine_type,
            state: BackendInstanceState::Provisioning,
            internal_ip: Some(internal_ip.to_string()),
            external_ip: None,
            labels: req.labels,
            created_at: Utc::now(),
        };

        state.instances.insert(
            key,
            InstanceEntry {
                instance: instance.clone(),
                boot_polls_left: self.config.boot_polls,
                delete_polls_left: None,
            },
        );
        Ok(instance)
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<()> {
        self.enter("delete_instance").await?;
        let mut state = self.state.lock();
        state.stats.delete_instance += 1;

        let key = key3(project, zone, name);
        let delete_polls = self.config.delete_polls;
        let Some(entry) = state.instances.get_mut(&key) else {
            return Err(CloudError::NotFound(format!("instance {}", name)));
        };

        if entry.delete_polls_left.is_some() {
            return Ok(());
        }

        if delete_polls == 0 {
            state.instances.remove(&key);
        } else {
            entry.instance.state = BackendInstanceState::Stopping;
            entry.delete_polls_left = Some(delete_polls);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    fn request(name: &str) -> InstanceRequest {
        InstanceRequest {
            name: name.to_string(),
            machine_type: "n2-standard-2".to_string(),
            image: "capi-ubuntu-2204".to_string(),
            labels: Labels::new(),
            metadata: Labels::new(),
        }
    }

    #[tokio::test]
    async fn test_instance_boots_after_polls() {
        let cloud = MemoryCloud::new(MemoryCloudConfig {
            boot_polls: 1,
            ..Default::default()
        });

        let created = cloud
            .insert_instance("p", "us-east1-b", request("vm-1"))
            .await
            .unwrap();
        assert_eq!(created.state, BackendInstanceState::Provisioning);
        assert_eq!(created.internal_ip.as_deref(), Some("10.0.0.2"));

        let first = cloud.get_instance("p", "us-east1-b", "vm-1").await.unwrap();
        assert_eq!(first.unwrap().state, BackendInstanceState::Staging);

        let second = cloud.get_instance("p", "us-east1-b", "vm-1").await.unwrap();
        assert_eq!(second.unwrap().state, BackendInstanceState::Running);
    }

    #[tokio::test]
    async fn test_insert_conflict_and_quota() {
        let cloud = MemoryCloud::new(MemoryCloudConfig {
            instance_quota: Some(1),
            ..Default::default()
        });

        cloud.insert_instance("p", "z", request("a")).await.unwrap();
        assert!(matches!(
            cloud.insert_instance("p", "z", request("a")).await,
            Err(CloudError::AlreadyExists(_))
        ));
        assert!(matches!(
            cloud.insert_instance("p", "z", request("b")).await,
            Err(CloudError::QuotaExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_takes_polls() {
        let cloud = MemoryCloud::new(MemoryCloudConfig {
            delete_polls: 2,
            ..Default::default()
        });
        cloud.insert_instance("p", "z", request("a")).await.unwrap();
        cloud.delete_instance("p", "z", "a").await.unwrap();

        for _ in 0..2 {
            let stopping = cloud.get_instance("p", "z", "a").await.unwrap().unwrap();
            assert_eq!(stopping.state, BackendInstanceState::Stopping);
        }
        assert!(cloud.get_instance("p", "z", "a").await.unwrap().is_none());
        assert!(matches!(
            cloud.delete_instance("p", "z", "a").await,
            Err(CloudError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_error_consumed_once() {
        let cloud = MemoryCloud::default();
        cloud.inject_error(CloudError::Transient("503".into()));
        assert_eq!(
            cloud.get_network("p", "net").await,
            Err(CloudError::Transient("503".into()))
        );
        assert_eq!(cloud.get_network("p", "net").await, Ok(None));
    }
}
