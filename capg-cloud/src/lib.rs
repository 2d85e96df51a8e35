//! capg cloud contract.
//!
//! Scopes give reconcilers a typed view of one Cluster, Machine or
//! MachinePool: a read-only Getter for desired state and a Setter for the
//! observed status. Reconcilers drive the backend through a shared
//! [`CloudHandle`] until it matches the scope, and a [`ReconcilePass`] runs
//! them in dependency order and turns failures into requeue decisions.
//!
//! ```text
//! stored spec -> Scope (Getter) -> Reconciler -> Cloud
//!                                      |
//!                    stored status <- Scope (Setter)
//! ```

pub mod bootstrap;
pub mod cloud;
pub mod context;
pub mod error;
pub mod pass;
pub mod reconciler;
pub mod scope;
pub mod types;

pub use bootstrap::{BootstrapSource, StaticBootstrap};
pub use cloud::{Cloud, CloudHandle, MemoryCloud, MemoryCloudConfig};
pub use context::Context;
pub use error::{CloudError, Result};
pub use pass::{Action, PassOutcome, ReconcilePass, RequeuePolicy};
pub use reconciler::{
    ControlPlaneAddressReconciler, InstanceReconciler, MachinePoolReconciler, NetworkReconciler,
    Reconciler,
};
pub use scope::{
    Client, Cluster, ClusterGetter, ClusterScope, ClusterSetter, Machine, MachineGetter, MachinePool,
    MachinePoolGetter, MachinePoolScope, MachinePoolSetter, MachineScope, MachineSetter,
};
pub use types::GROUP_VERSION;
