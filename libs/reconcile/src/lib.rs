//! Reconciliation engine for installable resources.
//!
//! Producers declare which resources (modules, configurations) they want
//! present; a single worker converges the host platform toward that desired
//! state. Key concepts:
//!
//! - **Entity**: the logical unit several resources compete for, e.g. one
//!   module name. Each entity has an ordered [`EntityResourceList`].
//! - **Active resource**: the first member of a group, the only one that is
//!   ever installed.
//! - **Cycle**: merge staged admissions, compute tasks, execute them in sort
//!   key order, persist, clean up.
//!
//! # Invariants
//!
//! - At most one member of a group is `INSTALLED` at the end of a cycle
//! - Only the worker mutates the resource table
//! - A full-set registration overrides everything earlier for its scheme
//! - The loop never exits except on deactivation

mod error;
mod events;
mod group;
mod installer;
mod resource;
mod store;
mod table;
mod task;

pub use error::{InstallerError, ResourceError, TaskError, VersionError};
pub use events::{
    InstallationEvent, InstallationListener, LifecycleEvent, LoggingListener, NoopListener,
    RetryTrigger,
};
pub use group::EntityResourceList;
pub use installer::{Installer, InstallerConfig, InstallerWorker};
pub use resource::{
    compare_resources, compute_digest, Attributes, InstallableResource, ModuleVersion,
    RegisteredResource, ResourceState, ResourceType, ATTR_NAME, ATTR_PID, ATTR_VERSION,
};
pub use store::{StateStore, StoreError};
pub use table::{GroupRecord, PersistentResourceTable, RECORD_VERSION};
pub use task::{
    InstallTask, RetryBudget, TaskContext, TaskCreator, TaskCreators, TaskOutcome, TaskSet,
    DEFAULT_MAX_RETRIES,
};
