//! Control-plane address reconciler - reserves the regional address the API
//! server is reached on and publishes it as the cluster endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::cloud::Address;
use crate::context::Context;
use crate::error::{CloudError, Result};
use crate::scope::Cluster;
use crate::types::ApiEndpoint;

/// Port the API server listens on unless configured otherwise.
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

pub struct ControlPlaneAddressReconciler<C: ?Sized> {
    scope: Arc<C>,
    port: u16,
}

impl<C: Cluster + ?Sized> ControlPlaneAddressReconciler<C> {
    pub fn new(scope: Arc<C>) -> Self {
        Self {
            scope,
            port: DEFAULT_API_SERVER_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Name of the reserved address.
    pub fn address_name(&self) -> String {
        format!("{}-apiserver", self.scope.name())
    }

    async fn fetch(&self, ctx: &Context, name: &str) -> Result<Option<Address>> {
        let cloud = self.scope.cloud();
        ctx.run(cloud.get_address(self.scope.project(), self.scope.region(), name))
            .await
    }

    fn record_address(&self, address: Option<String>) {
        let mut network = self.scope.network();
        if network.api_server_address != address {
            network.api_server_address = address;
            self.scope.set_network_status(network);
        }
    }
}

#[async_trait]
impl<C: Cluster + ?Sized> Reconciler for ControlPlaneAddressReconciler<C> {
    async fn reconcile(&self, ctx: &Context) -> Result<()> {
        let cloud = self.scope.cloud();
        let name = self.address_name();

        let existing = self.fetch(ctx, &name).await?;

        if let Some(endpoint) = self.scope.control_plane_endpoint() {
            if !existing.as_ref().is_some_and(|a| a.address == endpoint.host) {
                debug!(cluster = %self.scope.name(), endpoint = %endpoint, "Control plane endpoint provided, not reserving an address");
                return Ok(());
            }
        }

        let address = match existing {
            Some(address) => address,
            None => match ctx
                .run(cloud.insert_address(self.scope.project(), self.scope.region(), &name))
                .await
            {
                Ok(address) => {
                    info!(cluster = %self.scope.name(), address = %address.address, "Reserved control plane address");
                    address
                }
                Err(CloudError::AlreadyExists(_)) => {
                    self.fetch(ctx, &name).await?.ok_or_else(|| {
                        CloudError::Transient(format!("address {} not visible yet", name))
                    })?
                }
                Err(e) => {
                    warn!(cluster = %self.scope.name(), error = %e, "Failed to reserve control plane address");
                    return Err(e);
                }
            },
        };

        self.record_address(Some(address.address.clone()));
        self.scope
            .set_control_plane_endpoint(ApiEndpoint::new(address.address, self.port))
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        let cloud = self.scope.cloud();
        let name = self.address_name();

        let Some(address) = self.fetch(ctx, &name).await? else {
            debug!(cluster = %self.scope.name(), address = %name, "Address already released");
            self.record_address(None);
            return Ok(());
        };

        // An endpoint the address never backed was supplied by the user.
        if self.scope.network().api_server_address.is_none() {
            if let Some(endpoint) = self.scope.control_plane_endpoint() {
                if endpoint.host != address.address {
                    debug!(cluster = %self.scope.name(), address = %name, endpoint = %endpoint, "Address not reserved for this cluster, leaving it");
                    return Ok(());
                }
            }
        }

        match ctx
            .run(cloud.delete_address(self.scope.project(), self.scope.region(), &name))
            .await
        {
            Ok(()) | Err(CloudError::NotFound(_)) => {}
            Err(e) => {
                warn!(cluster = %self.scope.name(), address = %name, error = %e, "Failed to release address");
                return Err(e);
            }
        }

        if self.fetch(ctx, &name).await?.is_some() {
            return Err(CloudError::DeletionInProgress(format!("address {}", name)));
        }

        info!(cluster = %self.scope.name(), address = %name, "Released control plane address");
        self.record_address(None);
        Ok(())
    }
}
