//! Network reconciler - creates the cluster's VPC network so instances and
//! addresses have somewhere to live.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::cloud::{Network, NetworkRequest};
use crate::context::Context;
use crate::error::{CloudError, Result};
use crate::scope::Cluster;
use crate::types::{RESOURCE_LIFECYCLE_OWNED, cluster_tag_key};

/// Network reconciler for one cluster.
pub struct NetworkReconciler<C: ?Sized> {
    scope: Arc<C>,
}

impl<C: Cluster + ?Sized> NetworkReconciler<C> {
    pub fn new(scope: Arc<C>) -> Self {
        Self { scope }
    }

    fn owns(&self, network: &Network) -> bool {
        network
            .labels
            .get(&cluster_tag_key(self.scope.name()))
            .is_some_and(|v| v == RESOURCE_LIFECYCLE_OWNED)
    }

    async fn fetch(&self, ctx: &Context) -> Result<Option<Network>> {
        let cloud = self.scope.cloud();
        ctx.run(cloud.get_network(self.scope.project(), self.scope.network_name()))
            .await
    }
}

#[async_trait]
impl<C: Cluster + ?Sized> Reconciler for NetworkReconciler<C> {
    async fn reconcile(&self, ctx: &Context) -> Result<()> {
        let cloud = self.scope.cloud();
        let project = self.scope.project();
        let name = self.scope.network_name();

        let network = match self.fetch(ctx).await? {
            Some(network) => {
                debug!(cluster = %self.scope.name(), network = %name, "Network exists");
                network
            }
            None => {
                let req = NetworkRequest {
                    name: name.to_string(),
                    auto_create_subnetworks: self.scope.auto_create_subnetworks(),
                    labels: self.scope.additional_labels(),
                };
                match ctx.run(cloud.insert_network(project, req)).await {
                    Ok(network) => {
                        info!(cluster = %self.scope.name(), network = %name, "Network created");
                        network
                    }
                    // Lost a race with another writer; adopt what is there.
                    Err(CloudError::AlreadyExists(_)) => {
                        self.fetch(ctx).await?.ok_or_else(|| {
                            CloudError::Transient(format!("network {} not visible yet", name))
                        })?
                    }
                    Err(e) => {
                        warn!(cluster = %self.scope.name(), network = %name, error = %e, "Failed to create network");
                        return Err(e);
                    }
                }
            }
        };

        let mut status = self.scope.network();
        if status.self_link.as_deref() != Some(network.self_link.as_str()) {
            status.self_link = Some(network.self_link);
            self.scope.set_network_status(status);
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        let cloud = self.scope.cloud();
        let project = self.scope.project();
        let name = self.scope.network_name();

        let Some(network) = self.fetch(ctx).await? else {
            debug!(cluster = %self.scope.name(), network = %name, "Network already gone");
            return Ok(());
        };

        if !self.owns(&network) {
            info!(cluster = %self.scope.name(), network = %name, "Network not owned by cluster, leaving it in place");
            return Ok(());
        }

        match ctx.run(cloud.delete_network(project, name)).await {
            Ok(()) | Err(CloudError::NotFound(_)) => {}
            Err(e) => {
                warn!(cluster = %self.scope.name(), network = %name, error = %e, "Failed to delete network");
                return Err(e);
            }
        }

        if self.fetch(ctx).await?.is_some() {
            return Err(CloudError::DeletionInProgress(format!("network {}", name)));
        }

        info!(cluster = %self.scope.name(), network = %name, "Network deleted");
        let mut status = self.scope.network();
        status.self_link = None;
        self.scope.set_network_status(status);
        Ok(())
    }
}
