//! The persistent resource table.
//!
//! Maps entity ids to their [`EntityResourceList`]. The worker is its only
//! owner; producers never see it. Each group is persisted as a versioned
//! [`GroupRecord`]. The table also remembers the digest of the content last
//! installed per entity, so unchanged snapshots are recognized after a
//! restart.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::group::EntityResourceList;
use crate::resource::RegisteredResource;
use crate::store::StoreError;

/// Current group record format version.
pub const RECORD_VERSION: u32 = 2;

/// Serialized form of one entity group.
///
/// Version 1 records carry no `alias` and no `entity_id`; both default to
/// absent and the entity id is taken from the storage key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub version: u32,
    pub count: usize,
    pub resources: Vec<RegisteredResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Deserialize)]
struct RecordHeader {
    version: u32,
}

impl GroupRecord {
    /// Build the current-version record for a group.
    pub fn from_group(group: &EntityResourceList) -> Self {
        Self {
            version: RECORD_VERSION,
            count: group.len(),
            resources: group.resources().to_vec(),
            alias: group.alias().map(str::to_string),
            entity_id: Some(group.entity_id().to_string()),
        }
    }

    /// Encode as JSON.
    pub fn encode(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a record stored under `key`, rejecting unknown versions.
    pub fn decode(key: &str, raw: &str) -> Result<EntityResourceList, StoreError> {
        let header: RecordHeader = serde_json::from_str(raw)?;
        if header.version < 1 || header.version > RECORD_VERSION {
            return Err(StoreError::UnsupportedVersion {
                key: key.to_string(),
                version: header.version,
            });
        }

        let record: GroupRecord = serde_json::from_str(raw)?;
        if record.count != record.resources.len() {
            return Err(StoreError::CorruptRecord {
                key: key.to_string(),
                reason: format!(
                    "count {} does not match {} resources",
                    record.count,
                    record.resources.len()
                ),
            });
        }

        let (alias, entity_id) = if record.version > 1 {
            (record.alias, record.entity_id)
        } else {
            (None, None)
        };
        Ok(EntityResourceList::from_parts(
            entity_id.unwrap_or_else(|| key.to_string()),
            record.resources,
            alias,
        ))
    }
}

/// All tracked entity groups, keyed by entity id.
#[derive(Debug, Default)]
pub struct PersistentResourceTable {
    groups: BTreeMap<String, EntityResourceList>,
    installed_digests: BTreeMap<String, String>,
    next_sequence: u64,
}

impl PersistentResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from loaded groups.
    pub fn from_groups(groups: impl IntoIterator<Item = EntityResourceList>) -> Self {
        let groups: BTreeMap<String, EntityResourceList> = groups
            .into_iter()
            .map(|g| (g.entity_id().to_string(), g))
            .collect();
        let next_sequence = groups
            .values()
            .flat_map(|g| g.resources().iter().map(RegisteredResource::sequence))
            .max()
            .map_or(0, |max| max + 1);
        Self {
            groups,
            installed_digests: BTreeMap::new(),
            next_sequence,
        }
    }

    /// Restore the installed digests saved alongside the groups.
    pub fn with_installed_digests(
        mut self,
        digests: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.installed_digests.extend(digests);
        self
    }

    /// Digest of the content last installed for `entity_id`.
    pub fn installed_digest(&self, entity_id: &str) -> Option<&str> {
        self.installed_digests.get(entity_id).map(String::as_str)
    }

    /// Record the digest of the content just installed for `entity_id`, or
    /// forget it once the entity is uninstalled.
    pub fn set_installed_digest(&mut self, entity_id: &str, digest: Option<&str>) {
        match digest {
            Some(digest) => {
                self.installed_digests
                    .insert(entity_id.to_string(), digest.to_string());
            }
            None => {
                self.installed_digests.remove(entity_id);
            }
        }
    }

    pub fn installed_digests(&self) -> impl Iterator<Item = (&str, &str)> {
        self.installed_digests
            .iter()
            .map(|(id, digest)| (id.as_str(), digest.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of entity groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Number of tracked resources across all groups.
    pub fn resource_count(&self) -> usize {
        self.groups.values().map(EntityResourceList::len).sum()
    }

    pub fn group(&self, entity_id: &str) -> Option<&EntityResourceList> {
        self.groups.get(entity_id)
    }

    pub fn group_mut(&mut self, entity_id: &str) -> Option<&mut EntityResourceList> {
        self.groups.get_mut(entity_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &EntityResourceList> {
        self.groups.values()
    }

    /// Admit a resource into its entity group, creating the group if needed.
    ///
    /// Returns false if an identical resource was already tracked.
    pub fn admit(&mut self, mut resource: RegisteredResource) -> bool {
        resource.set_sequence(self.next_sequence);
        self.next_sequence += 1;
        self.groups
            .entry(resource.entity_id().to_string())
            .or_insert_with(|| EntityResourceList::new(resource.entity_id()))
            .add_or_update(resource)
    }

    /// Flag every resource of `scheme` as no longer installable.
    pub fn mark_scheme_uninstallable(&mut self, scheme: &str) -> usize {
        let mut marked = 0;
        for resource in self.groups.values_mut().flat_map(EntityResourceList::resources_mut) {
            if resource.scheme() == scheme && resource.is_installable() {
                debug!(url = %resource.url(), "Existing resource set to non-installable");
                resource.set_installable(false);
                marked += 1;
            }
        }
        marked
    }

    /// Flag every resource whose url is in `urls` as no longer installable.
    pub fn mark_urls_uninstallable(&mut self, urls: &HashSet<String>) -> usize {
        if urls.is_empty() {
            return 0;
        }
        let mut marked = 0;
        for resource in self.groups.values_mut().flat_map(EntityResourceList::resources_mut) {
            if urls.contains(resource.url()) {
                debug!(url = %resource.url(), "Marking uninstallable, url was removed");
                resource.set_installable(false);
                marked += 1;
            }
        }
        marked
    }

    /// Drop resources that are no longer installable nor needed.
    pub fn release_uninstallable(&mut self) -> usize {
        self.groups
            .values_mut()
            .map(EntityResourceList::release_uninstallable)
            .sum()
    }

    /// Compact every group and drop empty groups.
    ///
    /// Returns true if any group asked for another cycle.
    pub fn compact(&mut self) -> bool {
        let mut start_new_cycle = false;
        for group in self.groups.values_mut() {
            start_new_cycle |= group.compact();
        }
        self.groups.retain(|entity_id, group| {
            if group.is_empty() {
                debug!(entity_id = %entity_id, "Removing empty entity group");
            }
            !group.is_empty()
        });
        start_new_cycle
    }

    /// Records for all groups, keyed by entity id.
    pub fn records(&self) -> impl Iterator<Item = (&str, GroupRecord)> {
        self.groups
            .iter()
            .map(|(id, group)| (id.as_str(), GroupRecord::from_group(group)))
    }
}
