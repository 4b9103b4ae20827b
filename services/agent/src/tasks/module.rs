//! Module tasks.
//!
//! The digest of the content last installed per module lives in the
//! persistent table, so a snapshot whose content did not change is left alone
//! after a restart.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use converge_reconcile::{
    EntityResourceList, InstallTask, ModuleVersion, RegisteredResource, ResourceState,
    RetryBudget, TaskContext, TaskCreator, TaskError, TaskOutcome, TaskSet,
};
use tracing::{debug, info, warn};

use super::{
    MODULE_INSTALL_ORDER, MODULE_REFRESH_ORDER, MODULE_REMOVE_ORDER, MODULE_START_ORDER,
    MODULE_UPDATE_ORDER,
};
use crate::platform::{ModuleStatus, Platform};

/// State shared by every module task.
#[derive(Clone)]
struct ModuleTaskEnv {
    platform: Arc<dyn Platform>,
    max_retries: u32,
}

impl ModuleTaskEnv {
    fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_retries)
    }
}

/// Emits install and remove tasks for module groups.
pub struct ModuleTaskCreator {
    env: ModuleTaskEnv,
}

impl ModuleTaskCreator {
    pub fn new(platform: Arc<dyn Platform>, max_retries: u32) -> Self {
        Self {
            env: ModuleTaskEnv {
                platform,
                max_retries,
            },
        }
    }
}

impl TaskCreator for ModuleTaskCreator {
    fn create_tasks(&self, group: &EntityResourceList, tasks: &mut TaskSet) {
        let Some(active) = group.active_resource() else {
            return;
        };
        let task: Box<dyn InstallTask> = match active.state() {
            ResourceState::Install => Box::new(ModuleInstallTask::new(active.clone(), self.env.clone())),
            ResourceState::Uninstall => Box::new(ModuleRemoveTask::new(active.clone(), self.env.clone())),
            _ => return,
        };
        tasks.insert(task);
    }
}

fn module_name(resource: &RegisteredResource) -> Result<&str, TaskError> {
    resource
        .module_name()
        .ok_or_else(|| TaskError::Fatal(format!("{} has no module name", resource.url())))
}

fn module_version(resource: &RegisteredResource) -> Result<ModuleVersion, TaskError> {
    resource
        .module_version()
        .ok_or_else(|| TaskError::Fatal(format!("{} has no valid module version", resource.url())))
}

/// Give up on `resource`: park its group and report the failure.
fn give_up(ctx: &mut TaskContext<'_>, resource: &RegisteredResource, reason: String) -> TaskError {
    ctx.set_finish_state(resource.entity_id(), ResourceState::Ignored);
    TaskError::Fatal(reason)
}

/// Installs the active resource of a module group, or hands over to an
/// update if the module is already present.
pub struct ModuleInstallTask {
    resource: RegisteredResource,
    env: ModuleTaskEnv,
    budget: RetryBudget,
}

impl ModuleInstallTask {
    fn new(resource: RegisteredResource, env: ModuleTaskEnv) -> Self {
        let budget = env.budget();
        Self {
            resource,
            env,
            budget,
        }
    }
}

impl fmt::Display for ModuleInstallTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleInstallTask: {}", self.resource)
    }
}

#[async_trait]
impl InstallTask for ModuleInstallTask {
    fn sort_key(&self) -> String {
        format!("{}{}", MODULE_INSTALL_ORDER, self.resource.url())
    }

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let name = module_name(&self.resource)?.to_string();
        let version = module_version(&self.resource)?;

        let existing = match self.env.platform.find_module(&name).await {
            Ok(existing) => existing,
            Err(e) => return self.retry_or_give_up(ctx, format!("lookup of {} failed: {:#}", name, e)),
        };
        if existing.is_some() {
            debug!(name = %name, "Module already installed, updating instead");
            ctx.add_task_to_current_cycle(Box::new(ModuleUpdateTask::new(
                self.resource.clone(),
                self.env.clone(),
            )));
            return Ok(TaskOutcome::Done);
        }

        let Some(content) = self.resource.read_content() else {
            return Err(give_up(
                ctx,
                &self.resource,
                format!("{} provides no content, cannot install module", self.resource.url()),
            ));
        };

        match self.env.platform.install_module(&name, &version, &content).await {
            Ok(module) => {
                info!(module_id = module.module_id, name = %name, version = %version, "Module installed");
                ctx.set_installed_digest(self.resource.entity_id(), Some(self.resource.digest()));
                ctx.set_finish_state(self.resource.entity_id(), ResourceState::Installed);
                ctx.add_task_to_current_cycle(Box::new(ModuleStartTask::new(
                    &self.resource,
                    self.env.clone(),
                )));
                Ok(TaskOutcome::Done)
            }
            Err(e) => self.retry_or_give_up(ctx, format!("install of {} failed: {:#}", name, e)),
        }
    }
}

impl ModuleInstallTask {
    fn retry_or_give_up(
        &mut self,
        ctx: &mut TaskContext<'_>,
        reason: String,
    ) -> Result<TaskOutcome, TaskError> {
        if self.budget.record_failure() {
            return Err(give_up(ctx, &self.resource, reason));
        }
        warn!(task = %self, failures = self.budget.failures(), reason = %reason, "Install failed, retrying");
        Ok(TaskOutcome::RetryCurrentCycle)
    }
}

/// Replaces the content of an installed module with the active resource.
///
/// Skips the update when the installed version already matches, unless the
/// version is a snapshot whose digest changed.
pub struct ModuleUpdateTask {
    resource: RegisteredResource,
    env: ModuleTaskEnv,
    budget: RetryBudget,
    can_retry: bool,
    /// Status before the first attempt; later attempts see the module stopped.
    was_active: Option<bool>,
}

impl ModuleUpdateTask {
    fn new(resource: RegisteredResource, env: ModuleTaskEnv) -> Self {
        let budget = env.budget();
        Self {
            resource,
            env,
            budget,
            can_retry: true,
            was_active: None,
        }
    }

    async fn update(
        &mut self,
        ctx: &mut TaskContext<'_>,
        name: &str,
        version: &ModuleVersion,
    ) -> anyhow::Result<()> {
        let module = self
            .env
            .platform
            .find_module(name)
            .await?
            .ok_or_else(|| anyhow!("module {} vanished", name))?;
        let was_active = *self
            .was_active
            .get_or_insert(module.status == ModuleStatus::Active);

        self.env
            .platform
            .stop_module(module.module_id)
            .await
            .with_context(|| format!("stopping {}", name))?;

        let Some(content) = self.resource.read_content() else {
            self.can_retry = false;
            return Err(anyhow!(
                "{} provides no content, cannot update module",
                self.resource.url()
            ));
        };
        self.env
            .platform
            .update_module(module.module_id, version, &content)
            .await
            .with_context(|| format!("updating {}", name))?;

        ctx.set_installed_digest(self.resource.entity_id(), Some(self.resource.digest()));
        info!(module_id = module.module_id, name = %name, version = %version, "Module updated");

        ctx.set_finish_state(self.resource.entity_id(), ResourceState::Installed);
        ctx.add_task_to_current_cycle(Box::new(ModuleRefreshTask::new(self.env.clone())));
        if was_active {
            ctx.add_task_to_current_cycle(Box::new(ModuleStartTask::new(
                &self.resource,
                self.env.clone(),
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ModuleUpdateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleUpdateTask: {}", self.resource)
    }
}

#[async_trait]
impl InstallTask for ModuleUpdateTask {
    fn sort_key(&self) -> String {
        format!("{}{}", MODULE_UPDATE_ORDER, self.resource.url())
    }

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let name = module_name(&self.resource)?.to_string();
        let version = module_version(&self.resource)?;

        let live = match self.env.platform.find_module(&name).await {
            Ok(Some(live)) => live,
            Ok(None) => {
                return Err(give_up(
                    ctx,
                    &self.resource,
                    format!("module to update ({}) not found", name),
                ))
            }
            Err(e) => {
                return Err(give_up(
                    ctx,
                    &self.resource,
                    format!("lookup of {} failed: {:#}", name, e),
                ))
            }
        };

        if version.is_snapshot() {
            if ctx.installed_digest(self.resource.entity_id()) == Some(self.resource.digest()) {
                debug!(name = %name, "Snapshot digest did not change, ignoring update");
                ctx.set_finish_state(self.resource.entity_id(), ResourceState::Installed);
                return Ok(TaskOutcome::Done);
            }
        } else if live.version == version {
            debug!(name = %name, version = %version, "Same version is already installed, ignoring update");
            ctx.set_finish_state(self.resource.entity_id(), ResourceState::Installed);
            return Ok(TaskOutcome::Done);
        }

        match self.update(ctx, &name, &version).await {
            Ok(()) => Ok(TaskOutcome::Done),
            Err(e) if self.can_retry && !self.budget.record_failure() => {
                warn!(task = %self, failures = self.budget.failures(), error = %format!("{:#}", e), "Update failed, retrying");
                Ok(TaskOutcome::RetryCurrentCycle)
            }
            Err(e) => Err(give_up(ctx, &self.resource, format!("{:#}", e))),
        }
    }
}

/// Starts a module once its dependencies allow it.
///
/// A failed start is only retried after the platform reported new lifecycle
/// events.
pub struct ModuleStartTask {
    url: String,
    name: String,
    env: ModuleTaskEnv,
    budget: RetryBudget,
    events_at_failure: Option<u64>,
}

impl ModuleStartTask {
    fn new(resource: &RegisteredResource, env: ModuleTaskEnv) -> Self {
        let budget = env.budget();
        Self {
            url: resource.url().to_string(),
            name: resource.entity_name().to_string(),
            env,
            budget,
            events_at_failure: None,
        }
    }
}

impl fmt::Display for ModuleStartTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleStartTask: {} ({})", self.name, self.url)
    }
}

#[async_trait]
impl InstallTask for ModuleStartTask {
    fn sort_key(&self) -> String {
        format!("{}{}", MODULE_START_ORDER, self.url)
    }

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let events = ctx.retry_events_count();
        if self.events_at_failure == Some(events) {
            debug!(task = %self, events, "No lifecycle events since last failure, not retrying yet");
            return Ok(TaskOutcome::RetryNextCycle);
        }

        let module = match self.env.platform.find_module(&self.name).await {
            Ok(Some(module)) => module,
            Ok(None) => {
                debug!(name = %self.name, "Module to start is gone");
                return Ok(TaskOutcome::Done);
            }
            Err(e) => {
                let reason = format!("lookup of {} failed: {:#}", self.name, e);
                return Err(if self.budget.record_failure() {
                    TaskError::Fatal(reason)
                } else {
                    TaskError::Transient(reason)
                });
            }
        };
        if module.status == ModuleStatus::Active {
            return Ok(TaskOutcome::Done);
        }

        match self.env.platform.start_module(module.module_id).await {
            Ok(()) => {
                info!(module_id = module.module_id, name = %self.name, "Module started");
                Ok(TaskOutcome::Done)
            }
            Err(e) if self.budget.record_failure() => Err(TaskError::Fatal(format!(
                "start of {} failed {} times: {:#}",
                self.name,
                self.budget.failures(),
                e
            ))),
            Err(e) => {
                self.events_at_failure = Some(ctx.retry_events_count());
                info!(name = %self.name, error = %format!("{:#}", e), "Could not start module, will retry after lifecycle events");
                Ok(TaskOutcome::RetryNextCycle)
            }
        }
    }
}

/// Removes the active module of a group.
pub struct ModuleRemoveTask {
    resource: RegisteredResource,
    env: ModuleTaskEnv,
    budget: RetryBudget,
}

impl ModuleRemoveTask {
    fn new(resource: RegisteredResource, env: ModuleTaskEnv) -> Self {
        let budget = env.budget();
        Self {
            resource,
            env,
            budget,
        }
    }

    async fn remove(&self, name: &str) -> anyhow::Result<bool> {
        let Some(module) = self.env.platform.find_module(name).await? else {
            return Ok(false);
        };
        self.env.platform.stop_module(module.module_id).await?;
        self.env.platform.uninstall_module(module.module_id).await?;
        Ok(true)
    }
}

impl fmt::Display for ModuleRemoveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleRemoveTask: {}", self.resource)
    }
}

#[async_trait]
impl InstallTask for ModuleRemoveTask {
    fn sort_key(&self) -> String {
        format!("{}{}", MODULE_REMOVE_ORDER, self.resource.url())
    }

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let name = module_name(&self.resource)?.to_string();
        match self.remove(&name).await {
            Ok(removed) => {
                if removed {
                    info!(name = %name, "Module uninstalled");
                    ctx.add_task_to_current_cycle(Box::new(ModuleRefreshTask::new(self.env.clone())));
                } else {
                    debug!(name = %name, "Module to remove is not installed");
                }
                ctx.set_installed_digest(self.resource.entity_id(), None);
                ctx.set_finish_state(self.resource.entity_id(), ResourceState::Uninstalled);
                Ok(TaskOutcome::Done)
            }
            Err(e) if !self.budget.record_failure() => {
                warn!(task = %self, failures = self.budget.failures(), error = %format!("{:#}", e), "Uninstall failed, retrying");
                Ok(TaskOutcome::RetryCurrentCycle)
            }
            Err(e) => Err(give_up(
                ctx,
                &self.resource,
                format!("uninstall of {} failed: {:#}", name, e),
            )),
        }
    }
}

/// Refreshes module wiring; queued once per cycle at most.
///
/// A failed refresh runs again in the next cycle until its budget is spent.
pub struct ModuleRefreshTask {
    env: ModuleTaskEnv,
    budget: RetryBudget,
}

impl ModuleRefreshTask {
    fn new(env: ModuleTaskEnv) -> Self {
        let budget = env.budget();
        Self { env, budget }
    }
}

impl fmt::Display for ModuleRefreshTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleRefreshTask")
    }
}

#[async_trait]
impl InstallTask for ModuleRefreshTask {
    fn sort_key(&self) -> String {
        format!("{}refresh", MODULE_REFRESH_ORDER)
    }

    async fn execute(&mut self, _ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        match self.env.platform.refresh_modules().await {
            Ok(()) => Ok(TaskOutcome::Done),
            Err(e) if self.budget.record_failure() => Err(TaskError::Fatal(format!(
                "refresh failed {} times: {:#}",
                self.budget.failures(),
                e
            ))),
            Err(e) => Err(TaskError::Transient(format!("refresh failed: {:#}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use converge_reconcile::{
        InstallableResource, NoopListener, PersistentResourceTable, RetryTrigger, StateStore,
    };

    use super::*;
    use crate::platform::MockPlatform;

    struct Fixture {
        platform: Arc<MockPlatform>,
        env: ModuleTaskEnv,
        table: PersistentResourceTable,
        retry: RetryTrigger,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let platform = Arc::new(MockPlatform::new());
            let env = ModuleTaskEnv {
                platform: platform.clone(),
                max_retries: 2,
            };
            Self {
                platform,
                env,
                table: PersistentResourceTable::new(),
                retry: RetryTrigger::new(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn admit(&mut self, id: &str, version: &str, content: Option<&[u8]>) -> RegisteredResource {
            let resource =
                InstallableResource::module(id, "org.example.a", version, content.map(<[u8]>::to_vec));
            let registered = RegisteredResource::create("file", resource, self.dir.path()).unwrap();
            self.table.admit(registered);
            self.table
                .group("module:org.example.a")
                .unwrap()
                .resources()
                .iter()
                .find(|r| r.url() == format!("file:{}", id))
                .unwrap()
                .clone()
        }

        /// Run `task` and everything it queues for the current cycle.
        async fn run(&mut self, task: Box<dyn InstallTask>) -> (Vec<Result<TaskOutcome, String>>, TaskSet) {
            let mut current = TaskSet::new();
            let mut next = TaskSet::new();
            let mut outcomes = Vec::new();
            current.insert(task);
            while let Some(mut task) = current.pop_first() {
                let mut ctx = TaskContext::new(
                    &mut self.table,
                    &mut current,
                    &mut next,
                    &NoopListener,
                    &self.retry,
                );
                let result = task.execute(&mut ctx).await;
                match result {
                    Ok(TaskOutcome::RetryCurrentCycle) => {
                        current.insert(task);
                        outcomes.push(Ok(TaskOutcome::RetryCurrentCycle));
                    }
                    Ok(TaskOutcome::RetryNextCycle) => {
                        next.insert(task);
                        outcomes.push(Ok(TaskOutcome::RetryNextCycle));
                    }
                    Ok(outcome) => outcomes.push(Ok(outcome)),
                    Err(e) if e.is_transient() => {
                        next.insert(task);
                        outcomes.push(Err(e.to_string()));
                    }
                    Err(e) => outcomes.push(Err(e.to_string())),
                }
            }
            (outcomes, next)
        }

        fn state(&self) -> ResourceState {
            self.table
                .group("module:org.example.a")
                .unwrap()
                .first_resource()
                .unwrap()
                .state()
        }
    }

    #[tokio::test]
    async fn test_install_then_start() {
        let mut fx = Fixture::new();
        let resource = fx.admit("a.jar", "1.0.0", Some(b"v1"));
        let task = ModuleInstallTask::new(resource, fx.env.clone());

        let (outcomes, next) = fx.run(Box::new(task)).await;
        assert!(outcomes.iter().all(|o| *o == Ok(TaskOutcome::Done)));
        assert!(next.is_empty());
        assert_eq!(fx.state(), ResourceState::Installed);
        assert_eq!(fx.platform.operations().await, vec!["install org.example.a", "start org.example.a"]);
    }

    #[tokio::test]
    async fn test_install_without_content_gives_up() {
        let mut fx = Fixture::new();
        let resource = fx.admit("a.jar", "1.0.0", None);
        let (outcomes, _) = fx
            .run(Box::new(ModuleInstallTask::new(resource, fx.env.clone())))
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_err());
        assert_eq!(fx.state(), ResourceState::Ignored);
        assert!(fx.platform.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_same_version_is_noop() {
        let mut fx = Fixture::new();
        fx.platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        let resource = fx.admit("a.jar", "1.0.0", Some(b"v1"));

        let (outcomes, _) = fx
            .run(Box::new(ModuleInstallTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(outcomes, vec![Ok(TaskOutcome::Done), Ok(TaskOutcome::Done)]);
        assert_eq!(fx.state(), ResourceState::Installed);
        assert_eq!(fx.platform.operations().await, vec!["install org.example.a"]);
    }

    #[tokio::test]
    async fn test_update_restarts_active_module() {
        let mut fx = Fixture::new();
        let live = fx
            .platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        fx.platform.start_module(live.module_id).await.unwrap();
        let resource = fx.admit("a-2.jar", "2.0.0", Some(b"v2"));

        fx.run(Box::new(ModuleUpdateTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(fx.state(), ResourceState::Installed);
        assert_eq!(
            fx.platform.operations().await,
            vec![
                "install org.example.a",
                "start org.example.a",
                "stop org.example.a",
                "update org.example.a",
                "refresh",
                "start org.example.a",
            ]
        );
        assert_eq!(fx.platform.module_content("org.example.a").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_update_retries_in_current_cycle() {
        let mut fx = Fixture::new();
        fx.platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        fx.platform.fail_next_updates(2);
        let resource = fx.admit("a-2.jar", "2.0.0", Some(b"v2"));

        let (outcomes, _) = fx
            .run(Box::new(ModuleUpdateTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(
            outcomes,
            vec![
                Ok(TaskOutcome::RetryCurrentCycle),
                Ok(TaskOutcome::RetryCurrentCycle),
                Ok(TaskOutcome::Done),
                Ok(TaskOutcome::Done),
            ]
        );
        assert_eq!(fx.state(), ResourceState::Installed);
    }

    #[tokio::test]
    async fn test_update_gives_up_when_budget_exhausted() {
        let mut fx = Fixture::new();
        fx.platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        fx.platform.fail_next_updates(10);
        let resource = fx.admit("a-2.jar", "2.0.0", Some(b"v2"));

        let (outcomes, _) = fx
            .run(Box::new(ModuleUpdateTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[2].is_err());
        assert_eq!(fx.state(), ResourceState::Ignored);
    }

    #[tokio::test]
    async fn test_update_without_content_is_not_retried() {
        let mut fx = Fixture::new();
        fx.platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        let resource = fx.admit("a-2.jar", "2.0.0", None);

        let (outcomes, _) = fx
            .run(Box::new(ModuleUpdateTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_err());
        assert_eq!(fx.state(), ResourceState::Ignored);
    }

    #[tokio::test]
    async fn test_update_missing_module_is_fatal() {
        let mut fx = Fixture::new();
        let resource = fx.admit("a.jar", "1.0.0", Some(b"v1"));

        let (outcomes, _) = fx
            .run(Box::new(ModuleUpdateTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().unwrap_err().contains("not found"));
        assert_eq!(fx.state(), ResourceState::Ignored);
    }

    #[tokio::test]
    async fn test_snapshot_update_compares_digest() {
        let mut fx = Fixture::new();
        fx.platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0.SNAPSHOT").unwrap(), b"v1")
            .await
            .unwrap();
        let first = fx.admit("a.jar", "1.0.0.SNAPSHOT", Some(b"v1"));
        fx.table
            .set_installed_digest("module:org.example.a", Some(first.digest()));

        fx.run(Box::new(ModuleUpdateTask::new(first, fx.env.clone())))
            .await;
        assert_eq!(fx.platform.operations().await, vec!["install org.example.a"]);

        // same version, new content
        let changed = fx.admit("a-rebuilt.jar", "1.0.0.SNAPSHOT", Some(b"v2"));
        fx.run(Box::new(ModuleUpdateTask::new(changed, fx.env.clone())))
            .await;
        assert_eq!(
            fx.platform.operations().await,
            vec!["install org.example.a", "stop org.example.a", "update org.example.a", "refresh"]
        );
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_not_updated_after_reload() {
        let mut fx = Fixture::new();
        let resource = fx.admit("a.jar", "1.0.0.SNAPSHOT", Some(b"v1"));
        fx.run(Box::new(ModuleInstallTask::new(resource.clone(), fx.env.clone())))
            .await;
        assert_eq!(
            fx.table.installed_digest("module:org.example.a"),
            Some(resource.digest())
        );

        let db = fx.dir.path().join("installer.db");
        StateStore::open(&db).unwrap().save_table(&fx.table).unwrap();
        fx.table = StateStore::open(&db).unwrap().load_table().unwrap();

        let (outcomes, _) = fx
            .run(Box::new(ModuleUpdateTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(outcomes, vec![Ok(TaskOutcome::Done)]);
        assert_eq!(fx.state(), ResourceState::Installed);
        assert_eq!(
            fx.platform.operations().await,
            vec!["install org.example.a", "start org.example.a"]
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_kept_for_next_cycle() {
        let mut fx = Fixture::new();
        fx.platform.fail_next_refreshes(1);

        let (outcomes, mut next) = fx.run(Box::new(ModuleRefreshTask::new(fx.env.clone()))).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().unwrap_err().starts_with("transient failure"));
        assert_eq!(next.sort_keys().collect::<Vec<_>>(), vec!["60-refresh"]);

        let task = next.pop_first().unwrap();
        let (outcomes, next) = fx.run(task).await;
        assert_eq!(outcomes, vec![Ok(TaskOutcome::Done)]);
        assert!(next.is_empty());
        assert_eq!(fx.platform.operations().await, vec!["refresh"]);
    }

    #[tokio::test]
    async fn test_refresh_gives_up_when_budget_exhausted() {
        let mut fx = Fixture::new();
        fx.platform.fail_next_refreshes(10);

        let mut task: Box<dyn InstallTask> = Box::new(ModuleRefreshTask::new(fx.env.clone()));
        let mut errors = Vec::new();
        loop {
            let (outcomes, mut next) = fx.run(task).await;
            errors.extend(outcomes.into_iter().filter_map(Result::err));
            match next.pop_first() {
                Some(again) => task = again,
                None => break,
            }
        }
        assert_eq!(errors.len(), 3);
        assert!(errors[2].starts_with("fatal failure"));
    }

    #[tokio::test]
    async fn test_start_waits_for_lifecycle_events() {
        let mut fx = Fixture::new();
        let live = fx
            .platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        fx.platform.block_start("org.example.a").await;
        let resource = fx.admit("a.jar", "1.0.0", Some(b"v1"));
        let task = ModuleStartTask::new(&resource, fx.env.clone());

        let (outcomes, mut next) = fx.run(Box::new(task)).await;
        assert_eq!(outcomes, vec![Ok(TaskOutcome::RetryNextCycle)]);

        // no event since, not even attempted
        let task = next.pop_first().unwrap();
        let (outcomes, mut next) = fx.run(task).await;
        assert_eq!(outcomes, vec![Ok(TaskOutcome::RetryNextCycle)]);

        fx.platform.unblock_start("org.example.a").await;
        fx.retry.on_lifecycle_event(converge_reconcile::LifecycleEvent::ModuleResolved);
        let task = next.pop_first().unwrap();
        let (outcomes, next) = fx.run(task).await;
        assert_eq!(outcomes, vec![Ok(TaskOutcome::Done)]);
        assert!(next.is_empty());

        let module = fx.platform.find_module("org.example.a").await.unwrap().unwrap();
        assert_eq!(module.module_id, live.module_id);
        assert_eq!(module.status, ModuleStatus::Active);
    }

    #[tokio::test]
    async fn test_remove_uninstalls_and_refreshes() {
        let mut fx = Fixture::new();
        fx.platform
            .install_module("org.example.a", &ModuleVersion::parse("1.0.0").unwrap(), b"v1")
            .await
            .unwrap();
        fx.admit("a.jar", "1.0.0", Some(b"v1"));
        let group = fx.table.group_mut("module:org.example.a").unwrap();
        group.set_finish_state(ResourceState::Installed, &NoopListener);
        group.remove("file:a.jar");
        let resource = group.active_resource().unwrap().clone();
        fx.table
            .set_installed_digest("module:org.example.a", Some(resource.digest()));

        fx.run(Box::new(ModuleRemoveTask::new(resource, fx.env.clone())))
            .await;
        assert_eq!(fx.state(), ResourceState::Uninstalled);
        assert!(fx.table.installed_digest("module:org.example.a").is_none());
        assert!(fx.platform.find_module("org.example.a").await.unwrap().is_none());
        assert_eq!(
            fx.platform.operations().await,
            vec!["install org.example.a", "uninstall org.example.a", "refresh"]
        );
    }

    #[test]
    fn test_creator_emits_by_state() {
        let mut fx = Fixture::new();
        fx.admit("a.jar", "1.0.0", Some(b"v1"));
        let creator = ModuleTaskCreator::new(fx.env.platform.clone(), 2);

        let mut tasks = TaskSet::new();
        creator.create_tasks(fx.table.group("module:org.example.a").unwrap(), &mut tasks);
        assert_eq!(tasks.sort_keys().collect::<Vec<_>>(), vec!["50-file:a.jar"]);

        let group = fx.table.group_mut("module:org.example.a").unwrap();
        group.set_finish_state(ResourceState::Installed, &NoopListener);
        let mut tasks = TaskSet::new();
        creator.create_tasks(fx.table.group("module:org.example.a").unwrap(), &mut tasks);
        assert!(tasks.is_empty());

        fx.table
            .group_mut("module:org.example.a")
            .unwrap()
            .remove("file:a.jar");
        creator.create_tasks(fx.table.group("module:org.example.a").unwrap(), &mut tasks);
        assert_eq!(tasks.sort_keys().collect::<Vec<_>>(), vec!["30-file:a.jar"]);
    }

    #[test]
    fn test_sort_keys_follow_phase_order() {
        let fx = Fixture::new();
        let resource = RegisteredResource::create(
            "file",
            InstallableResource::module("a.jar", "a", "1.0.0", None),
            Path::new("/nonexistent"),
        )
        .unwrap();
        let keys = [
            ModuleRemoveTask::new(resource.clone(), fx.env.clone()).sort_key(),
            ModuleUpdateTask::new(resource.clone(), fx.env.clone()).sort_key(),
            ModuleInstallTask::new(resource.clone(), fx.env.clone()).sort_key(),
            ModuleRefreshTask::new(fx.env.clone()).sort_key(),
            ModuleStartTask::new(&resource, fx.env.clone()).sort_key(),
        ];
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
