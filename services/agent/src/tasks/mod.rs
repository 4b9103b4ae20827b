//! Platform tasks and the creators emitting them.
//!
//! Sort keys start with a phase prefix, so within a cycle configurations are
//! removed before they are applied, and modules are removed, updated,
//! installed, refreshed and started in that order.

mod configuration;
mod module;

use std::sync::Arc;

use converge_reconcile::{ResourceType, TaskCreators};

pub use configuration::{ConfigApplyTask, ConfigRemoveTask, ConfigTaskCreator};
pub use module::{
    ModuleInstallTask, ModuleRefreshTask, ModuleRemoveTask, ModuleStartTask, ModuleTaskCreator,
    ModuleUpdateTask,
};

use crate::platform::Platform;

pub const CONFIG_REMOVE_ORDER: &str = "10-";
pub const CONFIG_APPLY_ORDER: &str = "20-";
pub const MODULE_REMOVE_ORDER: &str = "30-";
pub const MODULE_UPDATE_ORDER: &str = "40-";
pub const MODULE_INSTALL_ORDER: &str = "50-";
pub const MODULE_REFRESH_ORDER: &str = "60-";
pub const MODULE_START_ORDER: &str = "70-";

/// Task creators for modules and configurations on `platform`.
pub fn default_creators(platform: Arc<dyn Platform>, max_retries: u32) -> TaskCreators {
    TaskCreators::new()
        .with(
            ResourceType::Module,
            Arc::new(ModuleTaskCreator::new(Arc::clone(&platform), max_retries)),
        )
        .with(
            ResourceType::Config,
            Arc::new(ConfigTaskCreator::new(platform, max_retries)),
        )
}
