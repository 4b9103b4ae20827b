//! Installation notifications and the retry trigger.
//!
//! The installer reports progress through [`InstallationListener`]. In the
//! other direction, platform lifecycle notifications feed the
//! [`RetryTrigger`], which counts them and wakes an idle worker when tasks
//! are waiting for a retry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::resource::ResourceState;

/// Notification emitted by the installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationEvent {
    /// The worker left the idle state and is processing resources.
    Started,

    /// The worker has nothing left to do and went idle.
    Suspended,

    /// A task finished processing the active resource of a group.
    Processed {
        url: String,
        entity_id: String,
        state: ResourceState,
    },
}

/// Observer of installation progress.
pub trait InstallationListener: Send + Sync {
    fn on_event(&self, event: &InstallationEvent);
}

/// Listener that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl InstallationListener for NoopListener {
    fn on_event(&self, _event: &InstallationEvent) {}
}

/// Listener that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl InstallationListener for LoggingListener {
    fn on_event(&self, event: &InstallationEvent) {
        match event {
            InstallationEvent::Started => debug!("Installer started processing"),
            InstallationEvent::Suspended => debug!("Installer suspended"),
            InstallationEvent::Processed {
                url,
                entity_id,
                state,
            } => info!(url = %url, entity_id = %entity_id, state = %state, "Resource processed"),
        }
    }
}

/// Lifecycle notification observed on the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ModuleInstalled,
    ModuleResolved,
    ModuleStarted,
    ModuleUpdated,
    ModuleStopped,
    ModuleUninstalled,
    /// Framework-level state change.
    Framework,
}

impl LifecycleEvent {
    /// Events after which a previously failing task may succeed.
    pub fn may_unblock_retries(&self) -> bool {
        matches!(
            self,
            Self::ModuleInstalled | Self::ModuleResolved | Self::ModuleStarted | Self::ModuleUpdated
        )
    }
}

/// Counts platform lifecycle events and wakes the worker for retries.
///
/// Created by the host before the installer and shared with whatever
/// observes platform events.
#[derive(Debug, Default)]
pub struct RetryTrigger {
    events: AtomicU64,
    retries_pending: AtomicBool,
    wake: Notify,
}

impl RetryTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a platform lifecycle event.
    pub fn on_lifecycle_event(&self, event: LifecycleEvent) {
        let count = self.events.fetch_add(1, Ordering::SeqCst) + 1;
        if event.may_unblock_retries() && self.retries_pending.load(Ordering::SeqCst) {
            debug!(?event, events_count = count, "Lifecycle event might unblock pending tasks, scheduling retries");
            self.wake.notify_one();
        }
    }

    /// Total number of lifecycle events observed so far.
    pub fn events_count(&self) -> u64 {
        self.events.load(Ordering::SeqCst)
    }

    /// Whether the worker holds tasks waiting for a retry.
    pub fn retries_pending(&self) -> bool {
        self.retries_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn set_retries_pending(&self, pending: bool) {
        self.retries_pending.store(pending, Ordering::SeqCst);
    }

    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }
}
