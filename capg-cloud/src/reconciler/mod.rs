//! Reconcilers for the infrastructure behind each resource.
//!
//! Each reconciler reads desired state through a scope's Getter, compares it
//! with what the backend reports, makes the minimal corrective calls and
//! writes observations back through the scope's Setter.

pub mod address;
pub mod instance;
pub mod network;
pub mod pool;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;

pub use address::ControlPlaneAddressReconciler;
pub use instance::InstanceReconciler;
pub use network::NetworkReconciler;
pub use pool::MachinePoolReconciler;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Converge the backend toward the scope's desired state.
    ///
    /// Safe to call repeatedly; once converged, further calls change nothing.
    async fn reconcile(&self, ctx: &Context) -> Result<()>;

    /// Remove the backend resource.
    ///
    /// Succeeds when the resource is confirmed absent and returns
    /// `DeletionInProgress` while the backend is still tearing it down.
    async fn delete(&self, ctx: &Context) -> Result<()>;
}
