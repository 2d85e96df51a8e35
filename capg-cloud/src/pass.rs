//! Reconciliation pass - applies a resource's reconcilers in dependency order.
//!
//! Reconcile runs the steps front to back and delete runs them back to front,
//! so the network exists before anything is placed on it and is removed last.
//! The first failing step ends the pass; the error class decides when the
//! resource should be looked at again.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::CloudError;
use crate::reconciler::Reconciler;

/// What the caller should do with the resource after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change or periodic resync.
    Done,
    /// Run another pass after the delay.
    Requeue(Duration),
    /// Do not retry until the desired state changes.
    Stop,
}

/// Requeue delays per error class.
#[derive(Debug, Clone)]
pub struct RequeuePolicy {
    pub transient: Duration,
    pub not_ready: Duration,
    pub in_progress: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            transient: Duration::from_secs(5),
            not_ready: Duration::from_secs(15),
            in_progress: Duration::from_secs(10),
        }
    }
}

impl RequeuePolicy {
    pub fn action_for(&self, err: &CloudError) -> Action {
        match err {
            CloudError::Cancelled => Action::Stop,
            CloudError::DeletionInProgress(_) => Action::Requeue(self.in_progress),
            e if e.is_not_ready() => Action::Requeue(self.not_ready),
            e if e.is_terminal() || e.is_invariant_violation() => Action::Stop,
            // Retryable errors plus backend bookkeeping that escaped a reconciler.
            _ => Action::Requeue(self.transient),
        }
    }
}

/// Result of one pass.
#[derive(Debug)]
pub struct PassOutcome {
    pub action: Action,
    pub error: Option<CloudError>,
    /// Steps that finished successfully, in the order they ran.
    pub completed: Vec<&'static str>,
}

impl PassOutcome {
    pub fn is_done(&self) -> bool {
        self.action == Action::Done
    }
}

/// Ordered list of named reconcilers for one resource.
pub struct ReconcilePass<'a> {
    steps: Vec<(&'static str, &'a dyn Reconciler)>,
    policy: RequeuePolicy,
}

impl<'a> ReconcilePass<'a> {
    pub fn new() -> Self {
        Self::with_policy(RequeuePolicy::default())
    }

    pub fn with_policy(policy: RequeuePolicy) -> Self {
        Self {
            steps: Vec::new(),
            policy,
        }
    }

    pub fn step(mut self, name: &'static str, reconciler: &'a dyn Reconciler) -> Self {
        self.steps.push((name, reconciler));
        self
    }

    pub async fn reconcile(&self, ctx: &Context) -> PassOutcome {
        let mut completed = Vec::with_capacity(self.steps.len());
        for (name, step) in &self.steps {
            debug!(step = name, "Reconciling");
            if let Err(e) = step.reconcile(ctx).await {
                return self.failed(name, e, completed);
            }
            completed.push(*name);
        }
        info!(steps = completed.len(), "Reconcile pass complete");
        self.done(completed)
    }

    pub async fn delete(&self, ctx: &Context) -> PassOutcome {
        let mut completed = Vec::with_capacity(self.steps.len());
        for (name, step) in self.steps.iter().rev() {
            debug!(step = name, "Deleting");
            if let Err(e) = step.delete(ctx).await {
                return self.failed(name, e, completed);
            }
            completed.push(*name);
        }
        info!(steps = completed.len(), "Delete pass complete");
        self.done(completed)
    }

    fn done(&self, completed: Vec<&'static str>) -> PassOutcome {
        PassOutcome {
            action: Action::Done,
            error: None,
            completed,
        }
    }

    fn failed(&self, step: &str, err: CloudError, completed: Vec<&'static str>) -> PassOutcome {
        let action = self.policy.action_for(&err);
        match action {
            Action::Stop if !err.is_cancellation() => {
                error!(step, error = %err, "Pass stopped")
            }
            Action::Stop => info!(step, "Pass cancelled"),
            Action::Requeue(after) if err.is_not_ready() || matches!(err, CloudError::DeletionInProgress(_)) => {
                debug!(step, error = %err, ?after, "Pass waiting")
            }
            Action::Requeue(after) => warn!(step, error = %err, ?after, "Pass failed, will retry"),
            Action::Done => {}
        }
        PassOutcome {
            action,
            error: Some(err),
            completed,
        }
    }
}

impl Default for ReconcilePass<'_> {
    fn default() -> Self {
        Self::new()
    }
}
