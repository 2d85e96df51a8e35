//! Machine pool reconciler - keeps the pool's member machines at the desired
//! replica count and drives each member's instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{InstanceReconciler, Reconciler};
use crate::context::Context;
use crate::error::{CloudError, Result};
use crate::scope::{
    Client, MachineGetter, MachinePoolGetter, MachinePoolScope, MachineScope, PoolMember,
    ScalePlan,
};
use crate::types::{InstanceStatus, MachineStatus};

/// Reconciler for one machine pool and its members.
pub struct MachinePoolReconciler {
    pool: Arc<MachinePoolScope>,
    members: Mutex<BTreeMap<String, Arc<MachineScope>>>,
}

impl MachinePoolReconciler {
    /// Build a reconciler from the pool and the member machines loaded with it.
    pub fn new(pool: Arc<MachinePoolScope>, members: Vec<Arc<MachineScope>>) -> Self {
        let members = members
            .into_iter()
            .map(|m| (m.name().to_string(), m))
            .collect();
        Self {
            pool,
            members: Mutex::new(members),
        }
    }

    pub fn pool(&self) -> &Arc<MachinePoolScope> {
        &self.pool
    }

    /// Current member machines, ordered by name.
    pub fn members(&self) -> Vec<Arc<MachineScope>> {
        self.members.lock().values().cloned().collect()
    }

    /// Members to create and delete to reach the replica count.
    pub fn plan(&self) -> ScalePlan {
        let existing: Vec<PoolMember> = self
            .members
            .lock()
            .values()
            .map(|m| PoolMember {
                name: m.name().to_string(),
                status: m.get_instance_status(),
            })
            .collect();
        self.pool.scale_plan(&existing)
    }

    fn add_member(&self, name: &str) {
        let scope = MachineScope::new(
            self.pool.member_spec(name),
            MachineStatus::default(),
            self.pool.cloud().clone(),
            self.pool.bootstrap(),
        );
        debug!(pool = %self.pool.name(), machine = %name, "Added pool member");
        self.members
            .lock()
            .insert(name.to_string(), Arc::new(scope));
    }

    /// Delete one member, forgetting it once its instance is gone.
    async fn remove_member(&self, ctx: &Context, member: Arc<MachineScope>) -> Result<()> {
        let name = member.name().to_string();
        InstanceReconciler::new(member).delete(ctx).await?;
        self.members.lock().remove(&name);
        info!(pool = %self.pool.name(), machine = %name, "Removed pool member");
        Ok(())
    }
}

/// Keep the first error, but stop at once on cancellation.
///
/// Configuration errors are already recorded on the failing member, which the
/// next plan replaces, so they do not hold back the rest of the pool.
fn collect(first: &mut Option<CloudError>, res: Result<()>) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancellation() => Err(e),
        Err(e) if e.is_terminal() => Ok(()),
        Err(e) => {
            if first.is_none() {
                *first = Some(e);
            }
            Ok(())
        }
    }
}

#[async_trait]
impl Reconciler for MachinePoolReconciler {
    async fn reconcile(&self, ctx: &Context) -> Result<()> {
        self.members
            .lock()
            .retain(|_, m| m.get_instance_status() != InstanceStatus::Deleted);

        let plan = self.plan();
        if !plan.is_empty() {
            info!(
                pool = %self.pool.name(),
                replicas = self.pool.replicas(),
                create = ?plan.create,
                delete = ?plan.delete,
                "Scaling machine pool"
            );
        }
        for name in &plan.create {
            self.add_member(name);
        }

        let (draining, active): (Vec<_>, Vec<_>) = self.members().into_iter().partition(|m| {
            plan.delete.iter().any(|n| n == m.name())
                || m.get_instance_status() == InstanceStatus::Deleting
        });

        let mut first = None;
        for member in draining {
            collect(&mut first, self.remove_member(ctx, member).await)?;
        }
        for member in active {
            let res = InstanceReconciler::new(member.clone()).reconcile(ctx).await;
            if let Err(e) = &res {
                warn!(pool = %self.pool.name(), machine = %member.name(), error = %e, "Pool member did not converge");
            }
            collect(&mut first, res)?;
        }

        first.map_or(Ok(()), Err)
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        let mut first = None;
        for member in self.members() {
            collect(&mut first, self.remove_member(ctx, member).await)?;
        }
        first.map_or(Ok(()), Err)
    }
}
