//! Instance reconciler - drives a machine's backend instance through its
//! lifecycle.
//!
//! The machine's `instance_status` is the only state carried between passes:
//!
//! ```text
//! Unknown -> Provisioning -> Running
//!    \            \            \
//!     +------------+------------+--> Failed      (terminal, never recreated)
//!     +------------+------------+--> Deleting -> Deleted
//! ```
//!
//! Backend states that mean the instance stopped on its own (`STOPPING`,
//! `STOPPED`, `SUSPENDED`, `TERMINATED`) and an instance vanishing after it was
//! created both mark the machine `Failed` with `InstanceTerminatedUnexpectedly`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::Reconciler;
use crate::cloud::{BackendInstanceState, Instance, InstanceRequest};
use crate::context::Context;
use crate::error::{CloudError, Result};
use crate::scope::Machine;
use crate::types::{
    INSTANCE_ANNOTATION, InstanceStatus, Labels, MachineStatusError, NodeAddress,
    RESOURCE_LIFECYCLE_OWNED, cluster_tag_key,
};

/// Instance label carrying the machine role.
pub const ROLE_LABEL: &str = "capg-role";
/// Metadata key the bootstrap payload is delivered under.
pub const USER_DATA_KEY: &str = "user-data";
/// Metadata key naming the control-plane instance group.
pub const CONTROL_PLANE_GROUP_KEY: &str = "capg-control-plane-group";

/// Instance reconciler for one machine.
pub struct InstanceReconciler<M: ?Sized> {
    scope: Arc<M>,
}

impl<M: Machine + ?Sized> InstanceReconciler<M> {
    pub fn new(scope: Arc<M>) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &Arc<M> {
        &self.scope
    }

    async fn lookup(&self, ctx: &Context) -> Result<Option<Instance>> {
        let cloud = self.scope.cloud();
        ctx.run(cloud.get_instance(
            self.scope.project(),
            self.scope.zone(),
            self.scope.name(),
        ))
        .await
    }

    fn request(&self, user_data: String) -> InstanceRequest {
        let mut labels = self.scope.additional_labels();
        labels.insert(
            cluster_tag_key(self.scope.cluster_name()),
            RESOURCE_LIFECYCLE_OWNED.to_string(),
        );
        labels.insert(ROLE_LABEL.to_string(), self.scope.role().as_str().to_string());

        let mut metadata = Labels::new();
        metadata.insert(USER_DATA_KEY.to_string(), user_data);
        if let Some(group) = self.scope.control_plane_group_name() {
            metadata.insert(CONTROL_PLANE_GROUP_KEY.to_string(), group.to_string());
        }

        InstanceRequest {
            name: self.scope.name().to_string(),
            machine_type: self.scope.machine_type().to_string(),
            image: self.scope.image().to_string(),
            labels,
            metadata,
        }
    }

    async fn create(&self, ctx: &Context) -> Result<Instance> {
        let user_data = self.scope.get_bootstrap_data(ctx).await?;
        let cloud = self.scope.cloud();

        let req = self.request(user_data);
        match ctx
            .run(cloud.insert_instance(self.scope.project(), self.scope.zone(), req))
            .await
        {
            Ok(instance) => {
                info!(
                    machine = %self.scope.name(),
                    zone = %self.scope.zone(),
                    id = %instance.id,
                    "Instance created"
                );
                Ok(instance)
            }
            // Created by an earlier pass whose result was lost.
            Err(CloudError::AlreadyExists(_)) => self.lookup(ctx).await?.ok_or_else(|| {
                CloudError::Transient(format!("instance {} not visible yet", self.scope.name()))
            }),
            Err(e) => Err(e),
        }
    }

    /// Record a configuration error on the machine and hand it back.
    fn fail_terminal(&self, err: CloudError) -> CloudError {
        let reason = match &err {
            CloudError::QuotaExceeded(_) => MachineStatusError::InsufficientResources,
            _ => MachineStatusError::InvalidConfiguration,
        };
        error!(machine = %self.scope.name(), reason = %reason, error = %err, "Instance can not be created");
        match self.scope.record_failure(reason, err.to_string()) {
            Ok(()) => err,
            Err(e) => e,
        }
    }

    fn fail_terminated(&self, message: String) -> Result<()> {
        error!(machine = %self.scope.name(), %message, "Instance terminated unexpectedly");
        self.scope
            .record_failure(MachineStatusError::InstanceTerminatedUnexpectedly, message)
    }

    /// Copy backend observations into the machine status.
    fn observe(&self, instance: &Instance) -> Result<()> {
        self.scope.set_instance_id(&instance.id);
        self.scope.set_provider_id()?;
        self.scope.set_annotation(INSTANCE_ANNOTATION, "true");

        match instance.state {
            BackendInstanceState::Provisioning | BackendInstanceState::Staging => {
                if self.scope.get_instance_status() == InstanceStatus::Running {
                    debug!(machine = %self.scope.name(), state = %instance.state, "Ignoring stale boot state");
                    return Ok(());
                }
                self.scope.set_instance_status(InstanceStatus::Provisioning)
            }
            BackendInstanceState::Running => {
                let mut addresses = Vec::new();
                if let Some(ip) = &instance.internal_ip {
                    addresses.push(NodeAddress::internal_ip(ip.clone()));
                }
                if let Some(ip) = &instance.external_ip {
                    addresses.push(NodeAddress::external_ip(ip.clone()));
                }
                self.scope.set_addresses(addresses);
                self.scope.set_instance_status(InstanceStatus::Running)
            }
            BackendInstanceState::Stopping
            | BackendInstanceState::Stopped
            | BackendInstanceState::Suspended
            | BackendInstanceState::Terminated => self.fail_terminated(format!(
                "instance {} in zone {} is {}",
                instance.name, instance.zone, instance.state
            )),
        }
    }

    fn mark_deleting(&self) -> Result<()> {
        match self.scope.get_instance_status() {
            InstanceStatus::Deleted => Ok(()),
            _ => self.scope.set_instance_status(InstanceStatus::Deleting),
        }
    }
}

#[async_trait]
impl<M: Machine + ?Sized> Reconciler for InstanceReconciler<M> {
    async fn reconcile(&self, ctx: &Context) -> Result<()> {
        let status = self.scope.get_instance_status();
        match status {
            InstanceStatus::Failed => {
                debug!(machine = %self.scope.name(), "Machine failed, not touching instance");
                return Ok(());
            }
            InstanceStatus::Deleting | InstanceStatus::Deleted => {
                debug!(machine = %self.scope.name(), %status, "Machine is being deleted");
                return Ok(());
            }
            _ => {}
        }

        let instance = match self.lookup(ctx).await? {
            Some(instance) => instance,
            None if self.scope.get_instance_id().is_some() || status == InstanceStatus::Running => {
                return self.fail_terminated(format!(
                    "instance {} in zone {} no longer exists",
                    self.scope.name(),
                    self.scope.zone()
                ));
            }
            None => match self.create(ctx).await {
                Ok(instance) => instance,
                Err(e) if e.is_terminal() => return Err(self.fail_terminal(e)),
                Err(e) if e.is_not_ready() => {
                    debug!(machine = %self.scope.name(), "Waiting for bootstrap data");
                    return Err(e);
                }
                Err(e) => {
                    warn!(machine = %self.scope.name(), error = %e, "Failed to create instance");
                    return Err(e);
                }
            },
        };

        self.observe(&instance)
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        let cloud = self.scope.cloud();
        let (project, zone, name) = (self.scope.project(), self.scope.zone(), self.scope.name());

        let Some(instance) = self.lookup(ctx).await? else {
            let status = self.scope.get_instance_status();
            if status == InstanceStatus::Unknown && self.scope.get_instance_id().is_none() {
                debug!(machine = %name, "Instance was never created");
                return Ok(());
            }
            self.mark_deleting()?;
            self.scope.set_instance_status(InstanceStatus::Deleted)?;
            info!(machine = %name, "Instance deleted");
            return Ok(());
        };

        self.mark_deleting()?;

        if instance.state != BackendInstanceState::Stopping {
            match ctx.run(cloud.delete_instance(project, zone, name)).await {
                Ok(()) | Err(CloudError::NotFound(_)) => {
                    info!(machine = %name, zone = %zone, "Instance deletion started");
                }
                Err(e) => {
                    warn!(machine = %name, error = %e, "Failed to delete instance");
                    return Err(e);
                }
            }
        }

        match self.lookup(ctx).await? {
            None => {
                self.scope.set_instance_status(InstanceStatus::Deleted)?;
                info!(machine = %name, "Instance deleted");
                Ok(())
            }
            Some(instance) => {
                debug!(machine = %name, state = %instance.state, "Waiting for instance to go away");
                Err(CloudError::DeletionInProgress(format!("instance {}", name)))
            }
        }
    }
}
