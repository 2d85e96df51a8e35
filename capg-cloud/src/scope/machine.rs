//! Machine scope backed by a loaded spec and status.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{Client, MachineGetter, MachineSetter};
use crate::bootstrap::BootstrapSource;
use crate::cloud::CloudHandle;
use crate::context::Context;
use crate::error::{CloudError, Result};
use crate::types::{
    Failure, InstanceStatus, Labels, MachineRole, MachineSpec, MachineStatus, MachineStatusError,
    NodeAddress,
};

/// Canonical provider ID for an instance.
pub fn provider_id(project: &str, zone: &str, name: &str) -> String {
    format!("gce://{}/{}/{}", project, zone, name)
}

/// In-memory view of one machine for the duration of a pass.
pub struct MachineScope {
    spec: MachineSpec,
    status: RwLock<MachineStatus>,
    cloud: CloudHandle,
    bootstrap: Arc<dyn BootstrapSource>,
}

impl MachineScope {
    pub fn new(
        spec: MachineSpec,
        status: MachineStatus,
        cloud: CloudHandle,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> Self {
        Self {
            spec,
            status: RwLock::new(status),
            cloud,
            bootstrap,
        }
    }

    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    /// Snapshot of the observed state, for the loop to persist.
    pub fn status(&self) -> MachineStatus {
        self.status.read().clone()
    }

    fn transition(&self, status: &mut MachineStatus, next: InstanceStatus) -> Result<()> {
        let current = status.instance_status;
        if !current.can_transition_to(next) {
            warn!(machine = %self.spec.name, from = %current, to = %next, "Rejected instance status transition");
            return Err(CloudError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        if current != next {
            info!(machine = %self.spec.name, from = %current, to = %next, "Instance status changed");
            status.instance_status = next;
        }
        Ok(())
    }
}

impl Client for MachineScope {
    fn cloud(&self) -> &CloudHandle {
        &self.cloud
    }
}

#[async_trait]
impl MachineGetter for MachineScope {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    fn cluster_name(&self) -> &str {
        &self.spec.cluster_name
    }

    fn zone(&self) -> &str {
        &self.spec.zone
    }

    fn project(&self) -> &str {
        &self.spec.project
    }

    fn role(&self) -> &MachineRole {
        &self.spec.role
    }

    fn machine_type(&self) -> &str {
        &self.spec.machine_type
    }

    fn image(&self) -> &str {
        &self.spec.image
    }

    fn additional_labels(&self) -> Labels {
        self.spec.additional_labels.clone()
    }

    fn get_instance_id(&self) -> Option<String> {
        self.status.read().instance_id.clone()
    }

    fn get_provider_id(&self) -> Option<String> {
        self.status.read().provider_id.clone()
    }

    fn get_instance_status(&self) -> InstanceStatus {
        self.status.read().instance_status
    }

    fn failure(&self) -> Option<Failure> {
        self.status.read().failure()
    }

    async fn get_bootstrap_data(&self, ctx: &Context) -> Result<String> {
        let Some(secret) = self.spec.bootstrap_secret.as_deref() else {
            debug!(machine = %self.spec.name, "Bootstrap secret not referenced yet");
            return Err(CloudError::BootstrapDataUnavailable(self.spec.name.clone()));
        };

        match ctx
            .run(self.bootstrap.fetch(&self.spec.namespace, secret))
            .await?
        {
            Some(data) => Ok(data),
            None => {
                debug!(machine = %self.spec.name, secret, "Bootstrap secret not found");
                Err(CloudError::BootstrapDataUnavailable(self.spec.name.clone()))
            }
        }
    }
}

impl MachineSetter for MachineScope {
    fn set_provider_id(&self) -> Result<()> {
        let derived = provider_id(&self.spec.project, &self.spec.zone, &self.spec.name);
        let mut status = self.status.write();
        match &status.provider_id {
            Some(current) if *current == derived => Ok(()),
            Some(current) => Err(CloudError::ProviderIdConflict {
                current: current.clone(),
                requested: derived,
            }),
            None => {
                info!(machine = %self.spec.name, provider_id = %derived, "Provider ID set");
                status.provider_id = Some(derived);
                Ok(())
            }
        }
    }

    fn set_instance_id(&self, id: &str) {
        let mut status = self.status.write();
        if status.instance_id.as_deref() != Some(id) {
            status.instance_id = Some(id.to_string());
        }
    }

    fn set_instance_status(&self, next: InstanceStatus) -> Result<()> {
        self.transition(&mut self.status.write(), next)
    }

    fn record_failure(&self, reason: MachineStatusError, message: String) -> Result<()> {
        let mut status = self.status.write();
        self.transition(&mut status, InstanceStatus::Failed)?;
        status.failure_reason = Some(reason);
        status.failure_message = Some(message);
        Ok(())
    }

    fn set_failure_message(&self, message: String) {
        self.status.write().failure_message = Some(message);
    }

    fn set_failure_reason(&self, reason: MachineStatusError) {
        self.status.write().failure_reason = Some(reason);
    }

    fn set_annotation(&self, key: &str, value: &str) {
        self.status
            .write()
            .annotations
            .insert(key.to_string(), value.to_string());
    }

    fn set_addresses(&self, addresses: Vec<NodeAddress>) {
        self.status.write().addresses = addresses;
    }
}
