//! Host platform interface and mock implementation.
//!
//! The platform interface abstracts the host's live registry:
//! - Installing, updating, starting, stopping and uninstalling modules
//! - Reading, applying and deleting configurations
//!
//! A mock implementation is provided for testing and development. It can
//! inject failures and reports lifecycle events to a [`RetryTrigger`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use converge_reconcile::{Attributes, LifecycleEvent, ModuleVersion, RetryTrigger};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Lifecycle status of a live module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Installed, dependencies not resolved yet.
    Installed,
    /// Dependencies resolved, not running.
    Resolved,
    /// Running.
    Active,
}

/// A module as currently known to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveModule {
    /// Platform-assigned id.
    pub module_id: u64,

    /// Unique module name.
    pub name: String,

    /// Installed version.
    pub version: ModuleVersion,

    /// Current status.
    pub status: ModuleStatus,
}

/// Host platform interface.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Look up an installed module by name.
    async fn find_module(&self, name: &str) -> Result<Option<LiveModule>>;

    /// Install a new module.
    async fn install_module(
        &self,
        name: &str,
        version: &ModuleVersion,
        content: &[u8],
    ) -> Result<LiveModule>;

    /// Replace the content of an installed module.
    async fn update_module(
        &self,
        module_id: u64,
        version: &ModuleVersion,
        content: &[u8],
    ) -> Result<()>;

    /// Start a module.
    async fn start_module(&self, module_id: u64) -> Result<()>;

    /// Stop a module. Stopping a module that is not running is a no-op.
    async fn stop_module(&self, module_id: u64) -> Result<()>;

    /// Uninstall a module.
    async fn uninstall_module(&self, module_id: u64) -> Result<()>;

    /// Re-resolve module wiring after updates and removals.
    async fn refresh_modules(&self) -> Result<()>;

    /// Current properties of a configuration.
    async fn get_config(&self, pid: &str) -> Result<Option<Attributes>>;

    /// Create or replace a configuration.
    async fn apply_config(&self, pid: &str, properties: &Attributes) -> Result<()>;

    /// Create a factory configuration instance; returns its generated pid.
    async fn create_factory_config(
        &self,
        factory_pid: &str,
        properties: &Attributes,
    ) -> Result<String>;

    /// Delete a configuration. Returns false if it did not exist.
    async fn delete_config(&self, pid: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct MockModule {
    live: LiveModule,
    content: Vec<u8>,
}

/// Mock platform for testing and development.
pub struct MockPlatform {
    /// Installed modules by id.
    modules: RwLock<BTreeMap<u64, MockModule>>,

    /// Configurations by pid.
    configs: RwLock<BTreeMap<String, Attributes>>,

    /// Module names whose start fails until unblocked.
    blocked_starts: RwLock<HashSet<String>>,

    /// Remaining updates that should fail.
    failing_updates: AtomicU32,

    /// Remaining refreshes that should fail.
    failing_refreshes: AtomicU32,

    /// Counter for module ids and factory pids.
    id_counter: AtomicU64,

    /// Log of mutating calls, for assertions.
    operations: RwLock<Vec<String>>,

    /// Receiver of lifecycle events.
    retry: Option<Arc<RetryTrigger>>,
}

impl MockPlatform {
    /// Create a new mock platform.
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
            configs: RwLock::new(BTreeMap::new()),
            blocked_starts: RwLock::new(HashSet::new()),
            failing_updates: AtomicU32::new(0),
            failing_refreshes: AtomicU32::new(0),
            id_counter: AtomicU64::new(0),
            operations: RwLock::new(Vec::new()),
            retry: None,
        }
    }

    /// Report lifecycle events to `retry`.
    pub fn with_retry_trigger(mut self, retry: Arc<RetryTrigger>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Make the next `count` module updates fail.
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` refreshes fail.
    pub fn fail_next_refreshes(&self, count: u32) {
        self.failing_refreshes.store(count, Ordering::SeqCst);
    }

    /// Make starts of module `name` fail, as if a dependency were missing.
    pub async fn block_start(&self, name: &str) {
        self.blocked_starts.write().await.insert(name.to_string());
    }

    /// Let module `name` start again; emits a resolved event.
    pub async fn unblock_start(&self, name: &str) {
        self.blocked_starts.write().await.remove(name);
        let mut modules = self.modules.write().await;
        for module in modules.values_mut().filter(|m| m.live.name == name) {
            if module.live.status == ModuleStatus::Installed {
                module.live.status = ModuleStatus::Resolved;
            }
        }
        drop(modules);
        self.emit(LifecycleEvent::ModuleResolved);
    }

    /// Emit a lifecycle event not caused by any module call.
    pub fn emit(&self, event: LifecycleEvent) {
        debug!(?event, "[MOCK] Lifecycle event");
        if let Some(retry) = &self.retry {
            retry.on_lifecycle_event(event);
        }
    }

    /// All installed modules.
    pub async fn modules(&self) -> Vec<LiveModule> {
        self.modules
            .read()
            .await
            .values()
            .map(|m| m.live.clone())
            .collect()
    }

    /// Content of the installed module `name`.
    pub async fn module_content(&self, name: &str) -> Option<Vec<u8>> {
        self.modules
            .read()
            .await
            .values()
            .find(|m| m.live.name == name)
            .map(|m| m.content.clone())
    }

    /// All configurations.
    pub async fn configs(&self) -> BTreeMap<String, Attributes> {
        self.configs.read().await.clone()
    }

    /// Log of mutating calls, oldest first.
    pub async fn operations(&self) -> Vec<String> {
        self.operations.read().await.clone()
    }

    async fn record(&self, operation: String) {
        self.operations.write().await.push(operation);
    }

    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn module_name(&self, module_id: u64) -> Result<String> {
        match self.modules.read().await.get(&module_id) {
            Some(module) => Ok(module.live.name.clone()),
            None => bail!("Module {} not found", module_id),
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn find_module(&self, name: &str) -> Result<Option<LiveModule>> {
        Ok(self
            .modules
            .read()
            .await
            .values()
            .find(|m| m.live.name == name)
            .map(|m| m.live.clone()))
    }

    async fn install_module(
        &self,
        name: &str,
        version: &ModuleVersion,
        content: &[u8],
    ) -> Result<LiveModule> {
        if self.find_module(name).await?.is_some() {
            bail!("Module {} is already installed", name);
        }

        let live = LiveModule {
            module_id: self.next_id(),
            name: name.to_string(),
            version: version.clone(),
            status: ModuleStatus::Installed,
        };
        info!(module_id = live.module_id, name = %name, version = %version, "[MOCK] Installing module");
        self.modules.write().await.insert(
            live.module_id,
            MockModule {
                live: live.clone(),
                content: content.to_vec(),
            },
        );
        self.record(format!("install {}", name)).await;
        self.emit(LifecycleEvent::ModuleInstalled);
        Ok(live)
    }

    async fn update_module(
        &self,
        module_id: u64,
        version: &ModuleVersion,
        content: &[u8],
    ) -> Result<()> {
        let name = self.module_name(module_id).await?;
        let remaining = self.failing_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_updates.store(remaining - 1, Ordering::SeqCst);
            bail!("Mock platform configured to fail update of {}", name);
        }

        info!(module_id, name = %name, version = %version, "[MOCK] Updating module");
        if let Some(module) = self.modules.write().await.get_mut(&module_id) {
            module.live.version = version.clone();
            module.live.status = ModuleStatus::Installed;
            module.content = content.to_vec();
        }
        self.record(format!("update {}", name)).await;
        self.emit(LifecycleEvent::ModuleUpdated);
        Ok(())
    }

    async fn start_module(&self, module_id: u64) -> Result<()> {
        let name = self.module_name(module_id).await?;
        if self.blocked_starts.read().await.contains(&name) {
            bail!("Module {} has unresolved dependencies", name);
        }

        if let Some(module) = self.modules.write().await.get_mut(&module_id) {
            if module.live.status == ModuleStatus::Active {
                return Ok(());
            }
            module.live.status = ModuleStatus::Active;
        }
        info!(module_id, name = %name, "[MOCK] Started module");
        self.record(format!("start {}", name)).await;
        self.emit(LifecycleEvent::ModuleStarted);
        Ok(())
    }

    async fn stop_module(&self, module_id: u64) -> Result<()> {
        let name = self.module_name(module_id).await?;
        if let Some(module) = self.modules.write().await.get_mut(&module_id) {
            if module.live.status != ModuleStatus::Active {
                return Ok(());
            }
            module.live.status = ModuleStatus::Resolved;
        }
        info!(module_id, name = %name, "[MOCK] Stopped module");
        self.record(format!("stop {}", name)).await;
        self.emit(LifecycleEvent::ModuleStopped);
        Ok(())
    }

    async fn uninstall_module(&self, module_id: u64) -> Result<()> {
        let name = self.module_name(module_id).await?;
        self.modules.write().await.remove(&module_id);
        info!(module_id, name = %name, "[MOCK] Uninstalled module");
        self.record(format!("uninstall {}", name)).await;
        self.emit(LifecycleEvent::ModuleUninstalled);
        Ok(())
    }

    async fn refresh_modules(&self) -> Result<()> {
        let remaining = self.failing_refreshes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_refreshes.store(remaining - 1, Ordering::SeqCst);
            bail!("Mock platform configured to fail refresh");
        }
        debug!("[MOCK] Refreshing modules");
        self.record("refresh".to_string()).await;
        self.emit(LifecycleEvent::Framework);
        Ok(())
    }

    async fn get_config(&self, pid: &str) -> Result<Option<Attributes>> {
        Ok(self.configs.read().await.get(pid).cloned())
    }

    async fn apply_config(&self, pid: &str, properties: &Attributes) -> Result<()> {
        info!(pid = %pid, "[MOCK] Applying configuration");
        self.configs
            .write()
            .await
            .insert(pid.to_string(), properties.clone());
        self.record(format!("apply {}", pid)).await;
        Ok(())
    }

    async fn create_factory_config(
        &self,
        factory_pid: &str,
        properties: &Attributes,
    ) -> Result<String> {
        let pid = format!("{}.{:04}", factory_pid, self.next_id());
        info!(factory_pid = %factory_pid, pid = %pid, "[MOCK] Creating factory configuration");
        self.configs
            .write()
            .await
            .insert(pid.clone(), properties.clone());
        self.record(format!("create {}", pid)).await;
        Ok(pid)
    }

    async fn delete_config(&self, pid: &str) -> Result<bool> {
        let existed = self.configs.write().await.remove(pid).is_some();
        if existed {
            info!(pid = %pid, "[MOCK] Deleted configuration");
            self.record(format!("delete {}", pid)).await;
        }
        Ok(existed)
    }
}
