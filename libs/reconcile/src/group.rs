//! Entity groups.
//!
//! An [`EntityResourceList`] holds every registered resource that competes
//! for one entity id, sorted so that the preferred resource comes first. The
//! first resource is the only one ever installed; its state drives the
//! transitions of its siblings.

use std::cmp::Ordering;

use tracing::debug;

use crate::events::{InstallationEvent, InstallationListener};
use crate::resource::{compare_resources, RegisteredResource, ResourceState};

/// Ordered resources sharing one entity id.
#[derive(Debug, Clone)]
pub struct EntityResourceList {
    entity_id: String,
    resources: Vec<RegisteredResource>,
    alias: Option<String>,
}

impl EntityResourceList {
    /// Create an empty group.
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            resources: Vec::new(),
            alias: None,
        }
    }

    pub(crate) fn from_parts(
        entity_id: String,
        resources: Vec<RegisteredResource>,
        alias: Option<String>,
    ) -> Self {
        let mut group = Self {
            entity_id,
            resources: Vec::with_capacity(resources.len()),
            alias,
        };
        for resource in resources {
            group.insert_sorted(resource);
        }
        group
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// All resources, highest priority first.
    pub fn resources(&self) -> &[RegisteredResource] {
        &self.resources
    }

    pub(crate) fn resources_mut(&mut self) -> impl Iterator<Item = &mut RegisteredResource> {
        self.resources.iter_mut()
    }

    /// Find a resource by url.
    pub fn get(&self, url: &str) -> Option<&RegisteredResource> {
        self.resources.iter().find(|r| r.url() == url)
    }

    pub fn first_resource(&self) -> Option<&RegisteredResource> {
        self.resources.first()
    }

    /// The resource a task should act on: the first one, if it still needs
    /// to be installed or uninstalled.
    pub fn active_resource(&self) -> Option<&RegisteredResource> {
        self.resources
            .first()
            .filter(|r| matches!(r.state(), ResourceState::Install | ResourceState::Uninstall))
    }

    /// The resource that takes over once the active one is gone.
    pub fn next_active_resource(&self) -> Option<&RegisteredResource> {
        self.active_resource()?;
        self.resources.get(1)
    }

    /// Alias assigned by the platform after install, if any.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The alias qualified with the entity type prefix.
    pub fn full_alias(&self) -> Option<String> {
        let alias = self.alias.as_ref()?;
        let prefix = self
            .entity_id
            .split_once(':')
            .map(|(prefix, _)| prefix)
            .unwrap_or(&self.entity_id);
        Some(format!("{}:{}", prefix, alias))
    }

    /// Record the outcome of a task on the active resource.
    ///
    /// Does nothing if there is no active resource.
    pub fn set_finish_state(&mut self, state: ResourceState, listener: &dyn InstallationListener) {
        let Some(active_state) = self.active_resource().map(RegisteredResource::state) else {
            return;
        };

        let mut state = state;
        if active_state == ResourceState::Uninstall && self.resources.len() > 1 {
            if let Some(second) = self.resources.get_mut(1) {
                if state == ResourceState::Uninstalled {
                    // first one is gone, go back to the second
                    if matches!(second.state(), ResourceState::Ignored | ResourceState::Installed) {
                        debug!(url = %second.url(), "Reactivating for next cycle");
                        second.set_state(ResourceState::Install);
                    }
                } else {
                    // the first did not get uninstalled, so the second must not install
                    if second.state() == ResourceState::Install {
                        second.set_state(ResourceState::Ignored);
                    }
                    state = ResourceState::Uninstalled;
                }
            }
        } else if state == ResourceState::Installed {
            for other in self.resources.iter_mut().skip(1) {
                if other.state() == ResourceState::Installed {
                    other.set_state(ResourceState::Install);
                }
            }
        }

        if let Some(active) = self.resources.first_mut() {
            active.set_state(state);
            listener.on_event(&InstallationEvent::Processed {
                url: active.url().to_string(),
                entity_id: self.entity_id.clone(),
                state,
            });
            if state == ResourceState::Uninstalled {
                active.cleanup();
            }
        }
    }

    /// Like [`set_finish_state`](Self::set_finish_state), also recording the
    /// alias the platform assigned.
    pub fn set_finish_state_with_alias(
        &mut self,
        state: ResourceState,
        alias: Option<String>,
        listener: &dyn InstallationListener,
    ) {
        self.set_finish_state(state, listener);
        self.alias = alias;
    }

    /// Add a resource, replacing any resource with the same url.
    ///
    /// Returns false if an identical resource was already present.
    pub fn add_or_update(&mut self, mut resource: RegisteredResource) -> bool {
        debug!(url = %resource.url(), entity_id = %self.entity_id, "Adding new resource");
        // a resource on its way out never counts as the current one for its url
        let current = self
            .resources
            .iter()
            .position(|r| r.url() == resource.url() && r.state() != ResourceState::Uninstall);
        if let Some(pos) = current {
            let existing = &mut self.resources[pos];
            if existing.is_same_resource(&resource) {
                existing.set_installable(resource.is_installable());
                resource.cleanup();
                return false;
            }
            if pos == 0 && existing.state() == ResourceState::Installed {
                // changed content for the installed resource, remove it before the new one goes in
                existing.set_state(ResourceState::Uninstall);
            } else {
                let mut obsolete = self.resources.remove(pos);
                debug!(url = %obsolete.url(), "Cleanup obsolete resource");
                obsolete.cleanup();
            }
        }
        self.insert_sorted(resource);
        true
    }

    /// Remove the resources with `url`.
    ///
    /// An active resource that is or may be installed is marked for
    /// uninstall and a pending uninstall is left alone; anything else is
    /// dropped right away.
    ///
    /// Unlike a plain delete, an active member already in `UNINSTALL` stays
    /// at the head of the group until its uninstall is confirmed, so the
    /// unit still present on the platform remains tracked.
    pub fn remove(&mut self, url: &str) {
        let positions: Vec<usize> = self
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.url() == url)
            .map(|(pos, _)| pos)
            .collect();
        for pos in positions.into_iter().rev() {
            self.remove_at(pos);
        }
    }

    fn remove_at(&mut self, pos: usize) {
        let Some(resource) = self.resources.get_mut(pos) else {
            return;
        };
        match (pos, resource.state()) {
            // already on its way out
            (0, ResourceState::Uninstall) => {}
            (0, ResourceState::Installed | ResourceState::Install) => {
                debug!(url = %resource.url(), "Marking for uninstalling");
                resource.set_state(ResourceState::Uninstall);
            }
            _ => {
                let mut unused = self.resources.remove(pos);
                debug!(url = %unused.url(), "Removing unused");
                unused.cleanup();
            }
        }
    }

    /// Remove every resource that is no longer installable and no longer
    /// needed.
    ///
    /// The only non-installable resource kept is an active one waiting for
    /// its uninstall. Returns the number of resources dropped.
    pub fn release_uninstallable(&mut self) -> usize {
        let before = self.resources.len();
        while let Some(pos) = self.resources.iter().enumerate().position(|(pos, r)| {
            !r.is_installable() && !(pos == 0 && r.state() == ResourceState::Uninstall)
        }) {
            self.remove_at(pos);
        }
        before - self.resources.len()
    }

    /// Drop uninstalled resources and stale uninstall markers.
    ///
    /// Returns true if something was dropped and the group still has members,
    /// meaning another cycle should run.
    pub fn compact(&mut self) -> bool {
        let mut start_new_cycle = false;
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.resources.len());
        for (pos, resource) in self.resources.drain(..).enumerate() {
            let state = resource.state();
            if state == ResourceState::Uninstalled || (pos > 0 && state == ResourceState::Uninstall) {
                removed.push(resource);
            } else {
                kept.push(resource);
            }
        }
        self.resources = kept;

        for mut resource in removed {
            if !self.resources.is_empty() {
                start_new_cycle = true;
            }
            debug!(url = %resource.url(), "Removing uninstalled from list");
            resource.cleanup();
        }
        start_new_cycle
    }

    fn insert_sorted(&mut self, resource: RegisteredResource) {
        let pos = self
            .resources
            .partition_point(|r| compare_resources(r, &resource) != Ordering::Greater);
        self.resources.insert(pos, resource);
    }
}
