//! Machine pool scope.
//!
//! A pool has no status of its own. It converges by changing the count of
//! member machines, each of which follows the machine state machine
//! independently.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Client, MachinePoolGetter, MachinePoolSetter};
use crate::bootstrap::BootstrapSource;
use crate::cloud::CloudHandle;
use crate::context::Context;
use crate::error::{CloudError, Result};
use crate::types::{InstanceStatus, MachinePoolSpec, MachineRole, MachineSpec};

/// Label recording which pool created a machine.
pub const POOL_LABEL: &str = "capg-machine-pool";

/// Name and current status of an existing pool member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    pub name: String,
    pub status: InstanceStatus,
}

/// Members to add and remove to reach the desired replica count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub create: Vec<String>,
    pub delete: Vec<String>,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

/// In-memory view of one machine pool.
pub struct MachinePoolScope {
    spec: MachinePoolSpec,
    cloud: CloudHandle,
    bootstrap: Arc<dyn BootstrapSource>,
}

impl MachinePoolScope {
    pub fn new(
        spec: MachinePoolSpec,
        cloud: CloudHandle,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> Self {
        Self {
            spec,
            cloud,
            bootstrap,
        }
    }

    pub fn spec(&self) -> &MachinePoolSpec {
        &self.spec
    }

    pub fn bootstrap(&self) -> Arc<dyn BootstrapSource> {
        Arc::clone(&self.bootstrap)
    }

    fn member_index(&self, name: &str) -> Option<u32> {
        name.strip_prefix(&self.spec.name)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    /// Name of the member at `index`.
    pub fn member_name(&self, index: u32) -> String {
        format!("{}-{}", self.spec.name, index)
    }

    /// Machine spec for a new member of this pool.
    pub fn member_spec(&self, name: &str) -> MachineSpec {
        let mut labels = self.spec.additional_labels.clone();
        labels.insert(POOL_LABEL.to_string(), self.spec.name.clone());
        MachineSpec {
            name: name.to_string(),
            namespace: self.spec.namespace.clone(),
            cluster_name: self.spec.cluster_name.clone(),
            project: self.spec.project.clone(),
            zone: self.spec.zone.clone(),
            role: MachineRole::Worker,
            machine_type: self.spec.machine_type.clone(),
            image: self.spec.image.clone(),
            bootstrap_secret: self.spec.bootstrap_secret.clone(),
            additional_labels: labels,
        }
    }

    /// Compute which members to create and delete.
    ///
    /// Members already deleting or deleted do not count toward the replica
    /// total. Failed members do not count either and are always removed, so a
    /// replacement is created under a fresh name. New members take the lowest
    /// free indices; healthy surplus is removed highest index first. Names that
    /// do not belong to the pool are ignored.
    pub fn scale_plan(&self, existing: &[PoolMember]) -> ScalePlan {
        let desired = self.spec.replicas as usize;

        let members: Vec<(u32, &PoolMember)> = existing
            .iter()
            .filter_map(|m| self.member_index(&m.name).map(|i| (i, m)))
            .collect();
        let taken: BTreeSet<u32> = members.iter().map(|(i, _)| *i).collect();

        let mut plan = ScalePlan::default();
        let mut healthy = Vec::new();
        for (index, m) in members {
            match m.status {
                InstanceStatus::Deleting | InstanceStatus::Deleted => {}
                InstanceStatus::Failed => plan.delete.push(m.name.clone()),
                _ => healthy.push((index, m)),
            }
        }

        if healthy.len() < desired {
            let mut index = 0;
            while healthy.len() + plan.create.len() < desired {
                if !taken.contains(&index) {
                    plan.create.push(self.member_name(index));
                }
                index += 1;
            }
        } else if healthy.len() > desired {
            healthy.sort_by(|(a, _), (b, _)| b.cmp(a));
            plan.delete.extend(
                healthy
                    .iter()
                    .take(healthy.len() - desired)
                    .map(|(_, m)| m.name.clone()),
            );
        }

        debug!(
            pool = %self.spec.name,
            desired,
            healthy = healthy.len(),
            create = plan.create.len(),
            delete = plan.delete.len(),
            "Computed scale plan"
        );
        plan
    }
}

impl Client for MachinePoolScope {
    fn cloud(&self) -> &CloudHandle {
        &self.cloud
    }
}

#[async_trait]
impl MachinePoolGetter for MachinePoolScope {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    fn zone(&self) -> &str {
        &self.spec.zone
    }

    fn replicas(&self) -> u32 {
        self.spec.replicas
    }

    async fn get_bootstrap_data(&self, ctx: &Context) -> Result<String> {
        let secret = self
            .spec
            .bootstrap_secret
            .as_deref()
            .ok_or_else(|| CloudError::BootstrapDataUnavailable(self.spec.name.clone()))?;

        ctx.run(self.bootstrap.fetch(&self.spec.namespace, secret))
            .await?
            .ok_or_else(|| CloudError::BootstrapDataUnavailable(self.spec.name.clone()))
    }
}

impl MachinePoolSetter for MachinePoolScope {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::StaticBootstrap;
    use crate::cloud::MemoryCloud;
    use crate::types::Labels;

    fn pool(replicas: u32) -> MachinePoolScope {
        let spec = MachinePoolSpec {
            name: "workers".into(),
            namespace: "default".into(),
            cluster_name: "prod".into(),
            project: "acme".into(),
            zone: "us-east1-c".into(),
            replicas,
            machine_type: "e2-standard-4".into(),
            image: "capi-ubuntu-2204".into(),
            bootstrap_secret: Some("workers-bootstrap".into()),
            additional_labels: Labels::new(),
        };
        MachinePoolScope::new(
            spec,
            CloudHandle::new(Arc::new(MemoryCloud::default()), "test"),
            Arc::new(StaticBootstrap::new()),
        )
    }

    fn member(name: &str, status: InstanceStatus) -> PoolMember {
        PoolMember {
            name: name.to_string(),
            status,
        }
    }

    #[test]
    fn test_scale_up_from_zero() {
        let plan = pool(3).scale_plan(&[]);
        assert_eq!(plan.create, vec!["workers-0", "workers-1", "workers-2"]);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_scale_up_fills_gaps() {
        let plan = pool(3).scale_plan(&[member("workers-1", InstanceStatus::Running)]);
        assert_eq!(plan.create, vec!["workers-0", "workers-2"]);
    }

    #[test]
    fn test_scale_down_removes_failed_first() {
        let plan = pool(1).scale_plan(&[
            member("workers-0", InstanceStatus::Running),
            member("workers-1", InstanceStatus::Failed),
            member("workers-2", InstanceStatus::Running),
        ]);
        assert_eq!(plan.delete, vec!["workers-1", "workers-2"]);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn test_failed_member_replaced_under_new_name() {
        let plan = pool(2).scale_plan(&[
            member("workers-0", InstanceStatus::Failed),
            member("workers-1", InstanceStatus::Running),
        ]);
        assert_eq!(plan.delete, vec!["workers-0"]);
        assert_eq!(plan.create, vec!["workers-2"]);
    }

    #[test]
    fn test_steady_state_is_empty() {
        let plan = pool(2).scale_plan(&[
            member("workers-0", InstanceStatus::Running),
            member("workers-1", InstanceStatus::Provisioning),
        ]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_deleting_members_do_not_count_and_keep_their_name() {
        let plan = pool(2).scale_plan(&[
            member("workers-0", InstanceStatus::Deleting),
            member("workers-1", InstanceStatus::Running),
        ]);
        assert_eq!(plan.create, vec!["workers-2"]);
    }

    #[test]
    fn test_foreign_names_ignored() {
        let plan = pool(1).scale_plan(&[
            member("other-0", InstanceStatus::Running),
            member("workers-x", InstanceStatus::Running),
        ]);
        assert_eq!(plan.create, vec!["workers-0"]);
    }

    #[test]
    fn test_member_spec() {
        let p = pool(1);
        let spec = p.member_spec("workers-0");
        assert_eq!(spec.role, MachineRole::Worker);
        assert_eq!(spec.zone, "us-east1-c");
        assert_eq!(
            spec.additional_labels.get(POOL_LABEL).map(String::as_str),
            Some("workers")
        );
    }

    #[tokio::test]
    async fn test_pool_bootstrap_data() {
        let bootstrap = Arc::new(StaticBootstrap::new());
        let p = MachinePoolScope::new(
            pool(1).spec().clone(),
            CloudHandle::new(Arc::new(MemoryCloud::default()), "test"),
            bootstrap.clone(),
        );
        let ctx = Context::new();
        assert!(matches!(
            p.get_bootstrap_data(&ctx).await,
            Err(CloudError::BootstrapDataUnavailable(_))
        ));
        bootstrap.insert("default", "workers-bootstrap", "#cloud-config");
        assert_eq!(p.get_bootstrap_data(&ctx).await.unwrap(), "#cloud-config");
    }
}
