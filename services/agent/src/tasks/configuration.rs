//! Configuration tasks.
//!
//! A config group's entity name is its pid. Names of the form
//! `factory-instance` denote factory configurations: the platform generates
//! the instance pid on first apply, and it is kept as the group alias.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use converge_reconcile::{
    Attributes, EntityResourceList, InstallTask, RegisteredResource, ResourceState, RetryBudget,
    TaskContext, TaskCreator, TaskError, TaskOutcome, TaskSet, ATTR_PID,
};
use tracing::{debug, info, warn};

use super::{CONFIG_APPLY_ORDER, CONFIG_REMOVE_ORDER};
use crate::platform::Platform;

/// Emits apply and remove tasks for configuration groups.
pub struct ConfigTaskCreator {
    platform: Arc<dyn Platform>,
    max_retries: u32,
}

impl ConfigTaskCreator {
    pub fn new(platform: Arc<dyn Platform>, max_retries: u32) -> Self {
        Self {
            platform,
            max_retries,
        }
    }
}

impl TaskCreator for ConfigTaskCreator {
    fn create_tasks(&self, group: &EntityResourceList, tasks: &mut TaskSet) {
        let Some(active) = group.active_resource() else {
            return;
        };
        let target = ConfigTarget::new(active, group.alias());
        let budget = RetryBudget::new(self.max_retries);
        let platform = Arc::clone(&self.platform);
        match active.state() {
            ResourceState::Install => {
                tasks.insert(Box::new(ConfigApplyTask {
                    target,
                    properties: properties(active),
                    platform,
                    budget,
                }));
            }
            ResourceState::Uninstall => {
                tasks.insert(Box::new(ConfigRemoveTask {
                    target,
                    platform,
                    budget,
                }));
            }
            _ => {}
        }
    }
}

/// Where a configuration lives on the platform.
#[derive(Debug, Clone)]
struct ConfigTarget {
    url: String,
    entity_id: String,
    pid: String,
    factory_pid: Option<String>,
    alias: Option<String>,
}

impl ConfigTarget {
    fn new(resource: &RegisteredResource, alias: Option<&str>) -> Self {
        let pid = resource.entity_name().to_string();
        let factory_pid = pid
            .split_once('-')
            .map(|(factory, _)| factory.to_string())
            .filter(|factory| !factory.is_empty());
        Self {
            url: resource.url().to_string(),
            entity_id: resource.entity_id().to_string(),
            pid,
            factory_pid,
            alias: alias.map(str::to_string),
        }
    }

    /// The pid the configuration is stored under on the platform.
    fn effective_pid(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.pid)
    }
}

impl fmt::Display for ConfigTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} ({}, alias {})", self.pid, self.url, alias),
            None => write!(f, "{} ({})", self.pid, self.url),
        }
    }
}

/// Config properties are the resource attributes minus the pid override.
fn properties(resource: &RegisteredResource) -> Attributes {
    resource
        .attributes()
        .iter()
        .filter(|(key, _)| key.as_str() != ATTR_PID)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Applies the active configuration of a group.
pub struct ConfigApplyTask {
    target: ConfigTarget,
    properties: Attributes,
    platform: Arc<dyn Platform>,
    budget: RetryBudget,
}

impl ConfigApplyTask {
    /// Apply the properties; returns the alias of a newly created factory
    /// configuration.
    async fn apply(&self) -> anyhow::Result<Option<String>> {
        let pid = self.target.effective_pid();
        if self.target.factory_pid.is_none() || self.target.alias.is_some() {
            if self.platform.get_config(pid).await?.as_ref() == Some(&self.properties) {
                debug!(pid = %pid, "Configuration unchanged");
            } else {
                self.platform.apply_config(pid, &self.properties).await?;
                info!(pid = %pid, url = %self.target.url, "Configuration applied");
            }
            return Ok(self.target.alias.clone());
        }

        let factory_pid = self.target.factory_pid.as_deref().unwrap_or(&self.target.pid);
        let alias = self
            .platform
            .create_factory_config(factory_pid, &self.properties)
            .await?;
        info!(factory_pid = %factory_pid, pid = %alias, url = %self.target.url, "Factory configuration created");
        Ok(Some(alias))
    }
}

impl fmt::Display for ConfigApplyTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigApplyTask: {}", self.target)
    }
}

#[async_trait]
impl InstallTask for ConfigApplyTask {
    fn sort_key(&self) -> String {
        format!("{}{}", CONFIG_APPLY_ORDER, self.target.url)
    }

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        match self.apply().await {
            Ok(alias) => {
                ctx.set_finish_state_with_alias(&self.target.entity_id, ResourceState::Installed, alias);
                Ok(TaskOutcome::Done)
            }
            Err(e) if !self.budget.record_failure() => {
                warn!(task = %self, failures = self.budget.failures(), error = %format!("{:#}", e), "Configuration apply failed, retrying");
                Ok(TaskOutcome::RetryCurrentCycle)
            }
            Err(e) => {
                ctx.set_finish_state(&self.target.entity_id, ResourceState::Ignored);
                Err(TaskError::Fatal(format!("apply of {} failed: {:#}", self.target.pid, e)))
            }
        }
    }
}

/// Deletes the configuration of a group marked for removal.
pub struct ConfigRemoveTask {
    target: ConfigTarget,
    platform: Arc<dyn Platform>,
    budget: RetryBudget,
}

impl fmt::Display for ConfigRemoveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigRemoveTask: {}", self.target)
    }
}

#[async_trait]
impl InstallTask for ConfigRemoveTask {
    fn sort_key(&self) -> String {
        format!("{}{}", CONFIG_REMOVE_ORDER, self.target.url)
    }

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let pid = self.target.effective_pid().to_string();
        match self.platform.delete_config(&pid).await {
            Ok(existed) => {
                if existed {
                    info!(pid = %pid, url = %self.target.url, "Configuration deleted");
                } else {
                    debug!(pid = %pid, "Configuration to delete does not exist");
                }
                ctx.set_finish_state_with_alias(&self.target.entity_id, ResourceState::Uninstalled, None);
                Ok(TaskOutcome::Done)
            }
            Err(e) if !self.budget.record_failure() => {
                warn!(task = %self, failures = self.budget.failures(), error = %format!("{:#}", e), "Configuration delete failed, retrying");
                Ok(TaskOutcome::RetryCurrentCycle)
            }
            Err(e) => {
                ctx.set_finish_state(&self.target.entity_id, ResourceState::Ignored);
                Err(TaskError::Fatal(format!("delete of {} failed: {:#}", pid, e)))
            }
        }
    }
}
