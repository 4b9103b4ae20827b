//! The installer: producer API and the worker loop.
//!
//! Producers call [`Installer::register_resources`] and
//! [`Installer::update_resources`] from any task; both only validate,
//! convert and send an admission over a channel. A single
//! [`InstallerWorker`] owns the resource table and drives it toward the
//! desired state:
//!
//! 1. merge staged admissions into the table
//! 2. compute tasks (carried-over retries plus one creator pass per group)
//! 3. go idle if nothing new needs doing, until an admission, a retry
//!    trigger or deactivation arrives
//! 4. otherwise execute the tasks in sort key order, persist, pause, clean up

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::InstallerError;
use crate::events::{InstallationEvent, InstallationListener, RetryTrigger};
use crate::resource::{InstallableResource, RegisteredResource};
use crate::store::StateStore;
use crate::table::PersistentResourceTable;
use crate::task::{TaskContext, TaskCreators, TaskOutcome, TaskSet};

/// Reserved delimiter between scheme and id in a resource url.
const SCHEME_DELIMITER: char = ':';

/// Installer configuration.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Pause after each cycle that executed tasks.
    pub cycle_delay: Duration,

    /// Pause after a failed cycle.
    pub error_backoff: Duration,

    /// Directory receiving the content of admitted resources.
    pub data_dir: PathBuf,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            cycle_delay: Duration::from_millis(250),
            error_backoff: Duration::from_millis(1500),
            data_dir: PathBuf::from("/var/lib/converge"),
        }
    }
}

/// A producer call, as seen by the worker.
#[derive(Debug)]
enum Admission {
    /// Complete desired set for a scheme.
    FullSet {
        scheme: String,
        resources: Vec<RegisteredResource>,
    },
    /// Incremental change within a scheme.
    Update {
        resources: Vec<RegisteredResource>,
        urls_to_remove: Vec<String>,
    },
}

impl Admission {
    fn into_resources(self) -> Vec<RegisteredResource> {
        match self {
            Self::FullSet { resources, .. } | Self::Update { resources, .. } => resources,
        }
    }
}

/// Admissions received since the last merge, applied in arrival order.
#[derive(Debug, Default)]
struct Staging {
    resources: Vec<RegisteredResource>,
    full_set_schemes: HashSet<String>,
    urls_to_remove: HashSet<String>,
}

impl Staging {
    fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.full_set_schemes.is_empty() && self.urls_to_remove.is_empty()
    }

    fn stage(&mut self, admission: Admission) {
        match admission {
            Admission::FullSet { scheme, resources } => {
                // a full set overrides anything not yet merged for its scheme
                self.drop_staged(|r| r.scheme() == scheme);
                self.urls_to_remove
                    .retain(|url| url.split_once(SCHEME_DELIMITER).map(|(s, _)| s) != Some(scheme.as_str()));
                debug!(scheme = %scheme, resources = resources.len(), "Staged full resource set");
                self.full_set_schemes.insert(scheme);
                self.resources.extend(resources);
            }
            Admission::Update {
                resources,
                urls_to_remove,
            } => {
                for resource in resources {
                    self.urls_to_remove.remove(resource.url());
                    self.resources.push(resource);
                }
                for url in urls_to_remove {
                    self.drop_staged(|r| r.url() == url);
                    debug!(url = %url, "Staged removal");
                    self.urls_to_remove.insert(url);
                }
            }
        }
    }

    fn drop_staged(&mut self, mut superseded: impl FnMut(&RegisteredResource) -> bool) {
        let (mut dropped, kept): (Vec<_>, Vec<_>) =
            self.resources.drain(..).partition(|r| superseded(r));
        self.resources = kept;
        for resource in &mut dropped {
            debug!(url = %resource.url(), "Dropping superseded staged resource");
            resource.cleanup();
        }
    }

    /// Apply everything staged to `table`.
    ///
    /// Returns false if nothing was staged.
    fn merge_into(&mut self, table: &mut PersistentResourceTable) -> bool {
        if self.is_empty() {
            return false;
        }
        for scheme in self.full_set_schemes.drain() {
            table.mark_scheme_uninstallable(&scheme);
        }
        for resource in self.resources.drain(..) {
            debug!(url = %resource.url(), entity_id = %resource.entity_id(), "Merging resource");
            table.admit(resource);
        }
        table.mark_urls_uninstallable(&self.urls_to_remove);
        self.urls_to_remove.clear();
        let released = table.release_uninstallable();
        if released > 0 {
            debug!(released, "Released uninstallable resources after merge");
        }
        true
    }
}

/// Producer handle to the installer.
///
/// Cheap to clone. Dropping every handle stops the worker.
#[derive(Clone)]
pub struct Installer {
    admissions: mpsc::UnboundedSender<Admission>,
    shutdown: Arc<watch::Sender<bool>>,
    retry: Arc<RetryTrigger>,
    data_dir: PathBuf,
}

impl Installer {
    /// Create the installer and its worker.
    ///
    /// The persisted table is restored from `store`; an unreadable table is
    /// logged and replaced by an empty one. The caller spawns
    /// [`InstallerWorker::run`].
    pub fn new(
        config: InstallerConfig,
        store: StateStore,
        creators: TaskCreators,
        listener: Arc<dyn InstallationListener>,
        retry: Arc<RetryTrigger>,
    ) -> (Self, InstallerWorker) {
        let (admissions_tx, admissions_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let table = store.load_or_empty();

        let installer = Self {
            admissions: admissions_tx,
            shutdown: Arc::new(shutdown_tx),
            retry: Arc::clone(&retry),
            data_dir: config.data_dir.clone(),
        };
        let worker = InstallerWorker {
            config,
            table,
            store,
            creators,
            listener,
            retry,
            admissions: admissions_rx,
            shutdown: shutdown_rx,
            staging: Staging::default(),
            next_cycle: TaskSet::new(),
            retries_scheduled: false,
        };
        (installer, worker)
    }

    /// Declare the complete set of resources for `scheme`.
    ///
    /// Previously registered resources of the scheme that are not part of
    /// `resources` are removed.
    pub fn register_resources(
        &self,
        scheme: &str,
        resources: Vec<InstallableResource>,
    ) -> Result<(), InstallerError> {
        check_scheme(scheme)?;
        let resources = self.create_resources(scheme, resources);
        debug!(scheme = %scheme, count = resources.len(), "Registering resources");
        self.send(Admission::FullSet {
            scheme: scheme.to_string(),
            resources,
        })
    }

    /// Add or replace `resources` and remove `ids_to_remove` within `scheme`.
    pub fn update_resources(
        &self,
        scheme: &str,
        resources: Vec<InstallableResource>,
        ids_to_remove: Vec<String>,
    ) -> Result<(), InstallerError> {
        check_scheme(scheme)?;
        if resources.is_empty() && ids_to_remove.is_empty() {
            return Ok(());
        }
        let resources = self.create_resources(scheme, resources);
        let urls_to_remove = ids_to_remove
            .into_iter()
            .map(|id| format!("{}{}{}", scheme, SCHEME_DELIMITER, id))
            .collect();
        self.send(Admission::Update {
            resources,
            urls_to_remove,
        })
    }

    /// Ask the worker to stop.
    ///
    /// The worker finishes the task in flight, persists the table and exits.
    pub fn deactivate(&self) {
        info!("Deactivating installer");
        self.shutdown.send_replace(true);
    }

    /// True until deactivated or the worker has exited.
    pub fn is_active(&self) -> bool {
        !*self.shutdown.borrow() && !self.admissions.is_closed()
    }

    /// Platform lifecycle events observed so far.
    pub fn retry_events_count(&self) -> u64 {
        self.retry.events_count()
    }

    /// The trigger to feed platform lifecycle events into.
    pub fn retry_trigger(&self) -> &Arc<RetryTrigger> {
        &self.retry
    }

    fn create_resources(
        &self,
        scheme: &str,
        resources: Vec<InstallableResource>,
    ) -> Vec<RegisteredResource> {
        resources
            .into_iter()
            .filter_map(|resource| {
                let id = resource.id.clone();
                match RegisteredResource::create(scheme, resource, &self.data_dir) {
                    Ok(registered) => Some(registered),
                    Err(e) => {
                        warn!(scheme = %scheme, id = %id, error = %e, "Resource will be ignored");
                        None
                    }
                }
            })
            .collect()
    }

    fn send(&self, admission: Admission) -> Result<(), InstallerError> {
        if *self.shutdown.borrow() {
            for mut resource in admission.into_resources() {
                resource.cleanup();
            }
            return Err(InstallerError::WorkerStopped);
        }
        self.admissions.send(admission).map_err(|rejected| {
            for mut resource in rejected.0.into_resources() {
                resource.cleanup();
            }
            InstallerError::WorkerStopped
        })
    }
}

fn check_scheme(scheme: &str) -> Result<(), InstallerError> {
    let reason = if scheme.is_empty() {
        "scheme must not be empty"
    } else if scheme.contains(SCHEME_DELIMITER) {
        "scheme must not contain ':'"
    } else {
        return Ok(());
    };
    Err(InstallerError::InvalidScheme {
        scheme: scheme.to_string(),
        reason,
    })
}

enum CycleOutcome {
    Continue,
    Stop,
}

enum Wake {
    Admission(Admission),
    Retry,
    Shutdown,
    Spurious,
}

/// The single owner of the resource table.
pub struct InstallerWorker {
    config: InstallerConfig,
    table: PersistentResourceTable,
    store: StateStore,
    creators: TaskCreators,
    listener: Arc<dyn InstallationListener>,
    retry: Arc<RetryTrigger>,
    admissions: mpsc::UnboundedReceiver<Admission>,
    shutdown: watch::Receiver<bool>,
    staging: Staging,
    next_cycle: TaskSet,
    retries_scheduled: bool,
}

impl InstallerWorker {
    /// The resource table as currently held by the worker.
    pub fn table(&self) -> &PersistentResourceTable {
        &self.table
    }

    /// Run cycles until deactivated or every [`Installer`] handle is gone.
    pub async fn run(mut self) {
        info!(
            cycle_delay_ms = self.config.cycle_delay.as_millis() as u64,
            groups = self.table.len(),
            "Starting installer worker"
        );
        self.listener.on_event(&InstallationEvent::Started);

        while !*self.shutdown.borrow() {
            match self.run_cycle().await {
                Ok(CycleOutcome::Continue) => {}
                Ok(CycleOutcome::Stop) => break,
                Err(e) => {
                    warn!(error = %e, "Installer cycle failed, backing off");
                    if self.pause(self.config.error_backoff).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist resource table on exit");
        }
        info!("Deactivated, exiting");
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome, InstallerError> {
        self.drain_admissions();
        if self.staging.merge_into(&mut self.table) {
            self.persist()?;
        }

        let (tasks, fresh) = self.compute_tasks();
        if fresh == 0 && !self.retries_scheduled {
            return self.go_idle(tasks).await;
        }

        self.retries_scheduled = false;
        if self.execute_tasks(tasks).await > 0 {
            debug!("Tasks have been executed, saving resource table");
            self.persist()?;
        }

        if self.pause(self.config.cycle_delay).await {
            return Ok(CycleOutcome::Stop);
        }
        self.cleanup()?;
        Ok(CycleOutcome::Continue)
    }

    fn drain_admissions(&mut self) {
        while let Ok(admission) = self.admissions.try_recv() {
            self.staging.stage(admission);
        }
    }

    /// Carried-over tasks plus a creator pass over every group.
    ///
    /// Returns the tasks and how many of them are new this cycle.
    fn compute_tasks(&mut self) -> (TaskSet, usize) {
        let mut tasks = TaskSet::new();
        tasks.append(&mut self.next_cycle);
        let fresh = self.creators.create_tasks(&self.table, &mut tasks);
        debug!(total = tasks.len(), fresh, "Computed tasks");
        (tasks, fresh)
    }

    async fn go_idle(&mut self, mut waiting: TaskSet) -> Result<CycleOutcome, InstallerError> {
        self.next_cycle.append(&mut waiting);
        self.retry.set_retries_pending(!self.next_cycle.is_empty());

        if self.cleanup()? {
            return Ok(CycleOutcome::Continue);
        }

        debug!(waiting = self.next_cycle.len(), "No tasks to process, going idle");
        self.listener.on_event(&InstallationEvent::Suspended);
        let wake = self.wait_for_work().await;

        match wake {
            Wake::Shutdown => return Ok(CycleOutcome::Stop),
            Wake::Admission(admission) => self.staging.stage(admission),
            Wake::Retry => {
                debug!(waiting = self.next_cycle.len(), "Retrying waiting tasks");
                self.retries_scheduled = true;
            }
            Wake::Spurious => {}
        }
        debug!("Notified of new work, back to work");
        self.listener.on_event(&InstallationEvent::Started);
        Ok(CycleOutcome::Continue)
    }

    async fn wait_for_work(&mut self) -> Wake {
        tokio::select! {
            admission = self.admissions.recv() => match admission {
                Some(admission) => Wake::Admission(admission),
                None => Wake::Shutdown,
            },
            _ = self.retry.notified() => Wake::Retry,
            changed = self.shutdown.changed() => {
                if changed.is_err() || *self.shutdown.borrow() {
                    Wake::Shutdown
                } else {
                    Wake::Spurious
                }
            }
        }
    }

    /// Execute tasks in sort key order. Returns how many ran.
    async fn execute_tasks(&mut self, mut tasks: TaskSet) -> usize {
        let mut executed = 0;
        while let Some(mut task) = tasks.pop_first() {
            if *self.shutdown.borrow() {
                debug!(remaining = tasks.len() + 1, "Deactivated, skipping remaining tasks");
                break;
            }

            info!(task = %task, "Executing task");
            let mut ctx = TaskContext::new(
                &mut self.table,
                &mut tasks,
                &mut self.next_cycle,
                self.listener.as_ref(),
                &self.retry,
            );
            let result = task.execute(&mut ctx).await;
            executed += 1;

            match result {
                Ok(TaskOutcome::Done) => {}
                Ok(TaskOutcome::RetryCurrentCycle) => {
                    debug!(task = %task, "Retrying task in current cycle");
                    tasks.insert(task);
                }
                Ok(TaskOutcome::RetryNextCycle) => {
                    debug!(task = %task, "Task kept for next cycle");
                    self.next_cycle.insert(task);
                    self.retry.set_retries_pending(true);
                }
                Err(e) if e.is_transient() => {
                    warn!(task = %task, error = %e, "Task failed, retrying in next cycle");
                    self.next_cycle.insert(task);
                    self.retry.set_retries_pending(true);
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "Removing failing task - unable to retry");
                }
            }
        }
        executed
    }

    /// Release non-installable resources, compact groups and persist.
    ///
    /// Returns true if another cycle should run right away.
    fn cleanup(&mut self) -> Result<bool, InstallerError> {
        let released = self.table.release_uninstallable();
        let start_new_cycle = self.table.compact();
        if released > 0 || start_new_cycle {
            debug!(released, start_new_cycle, "Cleaned up resource table");
        }
        self.persist()?;
        Ok(start_new_cycle)
    }

    fn persist(&mut self) -> Result<(), InstallerError> {
        self.store.save_table(&self.table)?;
        Ok(())
    }

    /// Sleep for `duration`. Returns true if deactivated meanwhile.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}
