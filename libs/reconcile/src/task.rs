//! Install tasks and the context they run in.
//!
//! A [`TaskCreator`] looks at one entity group and emits the tasks needed to
//! move its active resource forward. Tasks sit in a [`TaskSet`] ordered by
//! their sort key and are executed one at a time by the worker with a
//! [`TaskContext`] granting access to the resource table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::TaskError;
use crate::events::{InstallationListener, RetryTrigger};
use crate::group::EntityResourceList;
use crate::resource::{ResourceState, ResourceType};
use crate::table::PersistentResourceTable;

/// Default number of retries a task gets before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What the worker should do with a task after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task is finished.
    Done,
    /// Run the task again later in this cycle.
    RetryCurrentCycle,
    /// Keep the task for the next cycle.
    RetryNextCycle,
}

/// A unit of install work.
///
/// Tasks are ordered by [`sort_key`](InstallTask::sort_key); two tasks with
/// the same key are considered the same task.
#[async_trait]
pub trait InstallTask: Send + fmt::Display {
    fn sort_key(&self) -> String;

    async fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, TaskError>;
}

/// Tasks ordered by sort key, without duplicates.
#[derive(Default)]
pub struct TaskSet {
    tasks: BTreeMap<String, Box<dyn InstallTask>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task unless one with the same sort key is already queued.
    ///
    /// Returns true if the task was added.
    pub fn insert(&mut self, task: Box<dyn InstallTask>) -> bool {
        let key = task.sort_key();
        if self.tasks.contains_key(&key) {
            debug!(task = %task, "Task already queued");
            return false;
        }
        self.tasks.insert(key, task);
        true
    }

    /// Remove and return the task with the lowest sort key.
    pub fn pop_first(&mut self) -> Option<Box<dyn InstallTask>> {
        self.tasks.pop_first().map(|(_, task)| task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn sort_keys(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Move every task of `other` into this set; existing tasks win.
    ///
    /// Returns the number of tasks added.
    pub fn append(&mut self, other: &mut TaskSet) -> usize {
        let mut added = 0;
        while let Some(task) = other.pop_first() {
            if self.insert(task) {
                added += 1;
            }
        }
        added
    }
}

impl fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tasks.keys()).finish()
    }
}

/// Access granted to a running task.
pub struct TaskContext<'a> {
    table: &'a mut PersistentResourceTable,
    current_cycle: &'a mut TaskSet,
    next_cycle: &'a mut TaskSet,
    listener: &'a dyn InstallationListener,
    retry: &'a RetryTrigger,
    dirty: bool,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        table: &'a mut PersistentResourceTable,
        current_cycle: &'a mut TaskSet,
        next_cycle: &'a mut TaskSet,
        listener: &'a dyn InstallationListener,
        retry: &'a RetryTrigger,
    ) -> Self {
        Self {
            table,
            current_cycle,
            next_cycle,
            listener,
            retry,
            dirty: false,
        }
    }

    /// Queue a task to run later in the current cycle.
    pub fn add_task_to_current_cycle(&mut self, task: Box<dyn InstallTask>) {
        debug!(task = %task, "Adding task to current cycle");
        self.current_cycle.insert(task);
    }

    /// Keep a task for the next cycle.
    pub fn add_task_to_next_cycle(&mut self, task: Box<dyn InstallTask>) {
        debug!(task = %task, "Adding task to next cycle");
        self.next_cycle.insert(task);
        self.retry.set_retries_pending(true);
    }

    pub fn group(&self, entity_id: &str) -> Option<&EntityResourceList> {
        self.table.group(entity_id)
    }

    /// Record the outcome for the active resource of a group.
    ///
    /// Returns false if the group is gone.
    pub fn set_finish_state(&mut self, entity_id: &str, state: ResourceState) -> bool {
        let Some(group) = self.table.group_mut(entity_id) else {
            return false;
        };
        group.set_finish_state(state, self.listener);
        self.dirty = true;
        true
    }

    /// Like [`set_finish_state`](Self::set_finish_state), also recording the
    /// alias assigned by the platform.
    pub fn set_finish_state_with_alias(
        &mut self,
        entity_id: &str,
        state: ResourceState,
        alias: Option<String>,
    ) -> bool {
        let Some(group) = self.table.group_mut(entity_id) else {
            return false;
        };
        group.set_finish_state_with_alias(state, alias, self.listener);
        self.dirty = true;
        true
    }

    /// Digest of the content last installed for `entity_id`.
    pub fn installed_digest(&self, entity_id: &str) -> Option<&str> {
        self.table.installed_digest(entity_id)
    }

    /// Record what is now installed for `entity_id`; `None` forgets it.
    pub fn set_installed_digest(&mut self, entity_id: &str, digest: Option<&str>) {
        self.table.set_installed_digest(entity_id, digest);
        self.dirty = true;
    }

    /// Platform lifecycle events observed so far.
    pub fn retry_events_count(&self) -> u64 {
        self.retry.events_count()
    }

    /// True if a task changed the resource table.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Creates the tasks for entity groups of one resource type.
pub trait TaskCreator: Send + Sync {
    fn create_tasks(&self, group: &EntityResourceList, tasks: &mut TaskSet);
}

/// Task creators keyed by the resource type they handle.
#[derive(Default, Clone)]
pub struct TaskCreators {
    creators: HashMap<ResourceType, Arc<dyn TaskCreator>>,
}

impl TaskCreators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the creator for a resource type, replacing any previous one.
    pub fn with(mut self, resource_type: ResourceType, creator: Arc<dyn TaskCreator>) -> Self {
        self.creators.insert(resource_type, creator);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<&Arc<dyn TaskCreator>> {
        self.creators.get(&resource_type)
    }

    /// Let each group's creator add its tasks.
    ///
    /// A group is dispatched on the type of its first resource. Returns the
    /// number of tasks added.
    pub fn create_tasks(&self, table: &PersistentResourceTable, tasks: &mut TaskSet) -> usize {
        let before = tasks.len();
        for group in table.groups() {
            let Some(first) = group.first_resource() else {
                continue;
            };
            match self.get(first.resource_type()) {
                Some(creator) => creator.create_tasks(group, tasks),
                None => debug!(entity_id = %group.entity_id(), resource_type = %first.resource_type(), "No task creator for resource type"),
            }
        }
        tasks.len() - before
    }
}

impl fmt::Debug for TaskCreators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.creators.keys()).finish()
    }
}

/// Failure budget carried by a retrying task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    failures: u32,
    max_retries: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            failures: 0,
            max_retries,
        }
    }

    /// Record a failure.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures > self.max_retries
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
