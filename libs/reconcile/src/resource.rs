//! Resource model.
//!
//! Producers hand in [`InstallableResource`]s; on admission each becomes a
//! [`RegisteredResource`] that the worker tracks and persists. Resources that
//! compete for the same logical unit share an entity id, and
//! [`compare_resources`] decides which one of them is preferred.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ResourceError, VersionError};

/// Module attribute carrying the unique module name.
pub const ATTR_NAME: &str = "name";

/// Module attribute carrying the module version.
pub const ATTR_VERSION: &str = "version";

/// Config attribute overriding the pid derived from the resource id.
pub const ATTR_PID: &str = "pid";

/// Extensions stripped from a config id to derive its pid.
const CONFIG_EXTENSIONS: [&str; 3] = [".cfg", ".json", ".config"];

/// Subdirectory of the data directory holding spilled resource content.
const CONTENT_DIR: &str = "resources";

/// Resource attributes.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Kind of deployable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// An executable module.
    Module,
    /// A configuration object.
    Config,
}

impl ResourceType {
    /// Prefix used when building entity ids.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module => write!(f, "MODULE"),
            Self::Config => write!(f, "CONFIG"),
        }
    }
}

/// Lifecycle state of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    /// Desired, not yet applied.
    Install,
    /// Applied and confirmed active.
    Installed,
    /// Scheduled for removal.
    Uninstall,
    /// Removal confirmed.
    Uninstalled,
    /// Superseded by a higher priority sibling.
    Ignored,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "INSTALL",
            Self::Installed => "INSTALLED",
            Self::Uninstall => "UNINSTALL",
            Self::Uninstalled => "UNINSTALLED",
            Self::Ignored => "IGNORED",
        };
        write!(f, "{}", s)
    }
}

/// Module version, `major[.minor[.micro[.qualifier]]]`.
///
/// Missing numbers default to zero. The Maven form `1.0.0-SNAPSHOT` is also
/// accepted; everything after its first dash is the qualifier.
///
/// Versions order by their numbers, then by qualifier as a plain string. An
/// empty qualifier sorts lowest, so `1.0.0 < 1.0.0.SNAPSHOT`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleVersion {
    major: u64,
    minor: u64,
    micro: u64,
    qualifier: String,
}

impl ModuleVersion {
    /// Parse a version string.
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }

        let (numbers, qualifier): (Vec<&str>, Option<&str>) =
            match raw.splitn(4, '.').collect::<Vec<_>>().as_slice() {
                [major, minor, micro, qualifier] => (vec![*major, *minor, *micro], Some(*qualifier)),
                _ => match raw.split_once('-') {
                    Some((core, qualifier)) => (core.split('.').collect(), Some(qualifier)),
                    None => (raw.split('.').collect(), None),
                },
            };
        let qualifier = match qualifier {
            None => String::new(),
            Some(q) if is_valid_qualifier(q) => q.to_string(),
            Some(q) => return Err(VersionError::InvalidQualifier(q.to_string())),
        };

        let mut parsed = [0u64; 3];
        for (slot, number) in parsed.iter_mut().zip(&numbers) {
            *slot = parse_number(number)?;
        }
        let [major, minor, micro] = parsed;
        Ok(Self {
            major,
            minor,
            micro,
            qualifier,
        })
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    /// Volatile versions are compared by digest rather than by version.
    pub fn is_snapshot(&self) -> bool {
        self.qualifier.contains("SNAPSHOT")
    }
}

fn is_valid_qualifier(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_number(raw: &str) -> Result<u64, VersionError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VersionError::InvalidNumber(raw.to_string()));
    }
    raw.parse()
        .map_err(|_| VersionError::InvalidNumber(raw.to_string()))
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

/// A deployable unit as supplied by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallableResource {
    /// Producer-local id; combined with the scheme into the resource url.
    pub id: String,

    /// Kind of unit.
    pub resource_type: ResourceType,

    /// Unit attributes (module name and version, config properties).
    #[serde(default)]
    pub attributes: Attributes,

    /// Unit content, if any.
    #[serde(default)]
    pub content: Option<Vec<u8>>,

    /// Content digest; computed on admission when absent.
    #[serde(default)]
    pub digest: Option<String>,
}

impl InstallableResource {
    /// A module resource.
    pub fn module(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        content: Option<Vec<u8>>,
    ) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_NAME.to_string(), name.into().into());
        attributes.insert(ATTR_VERSION.to_string(), version.into().into());
        Self {
            id: id.into(),
            resource_type: ResourceType::Module,
            attributes,
            content,
            digest: None,
        }
    }

    /// A configuration resource whose attributes are the config properties.
    pub fn config(id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: id.into(),
            resource_type: ResourceType::Config,
            attributes,
            content: None,
            digest: None,
        }
    }

    /// Set an explicit digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

fn default_installable() -> bool {
    true
}

/// A resource tracked by the installer.
///
/// Mutated only by the worker; ordered within its entity group by
/// [`compare_resources`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredResource {
    url: String,
    entity_id: String,
    resource_type: ResourceType,
    digest: String,
    #[serde(default)]
    attributes: Attributes,
    state: ResourceState,
    #[serde(default = "default_installable")]
    installable: bool,
    #[serde(default)]
    sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_file: Option<PathBuf>,
}

impl RegisteredResource {
    /// Admit an installable resource under `scheme`.
    ///
    /// Content is written to a file below `data_dir` so that it outlives the
    /// producer call and survives restarts.
    pub fn create(
        scheme: &str,
        resource: InstallableResource,
        data_dir: &Path,
    ) -> Result<Self, ResourceError> {
        let url = format!("{}:{}", scheme, resource.id);

        let entity_name = match resource.resource_type {
            ResourceType::Module => {
                let name = string_attribute(&resource.attributes, ATTR_NAME).ok_or_else(|| {
                    ResourceError::MissingAttribute {
                        url: url.clone(),
                        attribute: ATTR_NAME,
                    }
                })?;
                let version = string_attribute(&resource.attributes, ATTR_VERSION).ok_or_else(
                    || ResourceError::MissingAttribute {
                        url: url.clone(),
                        attribute: ATTR_VERSION,
                    },
                )?;
                ModuleVersion::parse(version).map_err(|source| ResourceError::InvalidVersion {
                    url: url.clone(),
                    version: version.to_string(),
                    source,
                })?;
                name.to_string()
            }
            ResourceType::Config => string_attribute(&resource.attributes, ATTR_PID)
                .map(str::to_string)
                .unwrap_or_else(|| config_pid(&resource.id)),
        };
        let entity_id = format!("{}:{}", resource.resource_type.prefix(), entity_name);

        let digest = match resource.digest.filter(|d| !d.is_empty()) {
            Some(digest) => digest,
            None => compute_digest(
                resource.resource_type,
                &resource.attributes,
                resource.content.as_deref(),
            ),
        };

        let data_file = match resource.content {
            Some(content) => Some(spill_content(data_dir, &content).map_err(|source| {
                ResourceError::Content {
                    url: url.clone(),
                    source,
                }
            })?),
            None => None,
        };

        Ok(Self {
            url,
            entity_id,
            resource_type: resource.resource_type,
            digest,
            attributes: resource.attributes,
            state: ResourceState::Install,
            installable: true,
            sequence: 0,
            data_file,
        })
    }

    /// `scheme:id`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Scheme part of the url.
    pub fn scheme(&self) -> &str {
        self.url
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or(&self.url)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Entity id without its type prefix: the module name or config pid.
    pub fn entity_name(&self) -> &str {
        self.entity_id
            .split_once(':')
            .map(|(_, name)| name)
            .unwrap_or(&self.entity_id)
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn is_installable(&self) -> bool {
        self.installable
    }

    /// Admission sequence number assigned by the resource table.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Path of the spilled content file, if the resource carried content.
    pub fn data_file(&self) -> Option<&Path> {
        self.data_file.as_deref()
    }

    /// Module name, for module resources.
    pub fn module_name(&self) -> Option<&str> {
        string_attribute(&self.attributes, ATTR_NAME)
    }

    /// Module version, for module resources.
    pub fn module_version(&self) -> Option<ModuleVersion> {
        string_attribute(&self.attributes, ATTR_VERSION).and_then(|v| ModuleVersion::parse(v).ok())
    }

    /// Read the resource content.
    ///
    /// Returns `None` if the resource has no content or it can no longer be
    /// read.
    pub fn read_content(&self) -> Option<Vec<u8>> {
        let path = self.data_file.as_ref()?;
        match std::fs::read(path) {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(url = %self.url, path = %path.display(), error = %e, "Failed to read resource content");
                None
            }
        }
    }

    /// True if both resources carry the same url, digest and attributes.
    pub fn is_same_resource(&self, other: &Self) -> bool {
        self.url == other.url && self.digest == other.digest && self.attributes == other.attributes
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        if self.state != state {
            debug!(url = %self.url, from = %self.state, to = %state, "Resource state change");
            self.state = state;
        }
    }

    pub(crate) fn set_installable(&mut self, installable: bool) {
        self.installable = installable;
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Release transient resources held by this resource.
    ///
    /// Safe to call more than once.
    pub fn cleanup(&mut self) {
        let Some(path) = self.data_file.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(url = %self.url, path = %path.display(), "Removed resource content"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(url = %self.url, path = %path.display(), error = %e, "Failed to remove resource content")
            }
        }
    }
}

impl fmt::Display for RegisteredResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(url={}, entity={}, state={}, digest={})",
            self.resource_type, self.url, self.entity_id, self.state, self.digest
        )
    }
}

/// Priority ordering between resources of the same entity.
///
/// Modules sort by name ascending, then by version descending so that the
/// highest version comes first. Configs carry no priority of their own. The
/// admission sequence breaks all remaining ties, which makes the order total.
pub fn compare_resources(a: &RegisteredResource, b: &RegisteredResource) -> Ordering {
    let primary = match (a.resource_type, b.resource_type) {
        (ResourceType::Module, ResourceType::Module) => compare_modules(a, b),
        (ResourceType::Config, ResourceType::Config) => Ordering::Equal,
        (left, right) => left.cmp(&right),
    };
    primary.then_with(|| a.sequence.cmp(&b.sequence))
}

fn compare_modules(a: &RegisteredResource, b: &RegisteredResource) -> Ordering {
    let name_a = a.module_name().unwrap_or_default();
    let name_b = b.module_name().unwrap_or_default();
    name_a.cmp(name_b).then_with(|| {
        // higher version first
        b.module_version().cmp(&a.module_version())
    })
}

fn string_attribute<'a>(attributes: &'a Attributes, key: &str) -> Option<&'a str> {
    attributes.get(key).and_then(|v| v.as_str())
}

/// Derive a config pid from a resource id: `a.b.c.cfg` becomes `a.b.c`.
fn config_pid(id: &str) -> String {
    let name = id.rsplit('/').next().unwrap_or(id);
    CONFIG_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
        .to_string()
}

/// Compute a digest for a resource that was admitted without one.
pub fn compute_digest(
    resource_type: ResourceType,
    attributes: &Attributes,
    content: Option<&[u8]>,
) -> String {
    let mut hasher = Sha256::new();
    match (resource_type, content) {
        (ResourceType::Module, Some(content)) => hasher.update(content),
        _ => {
            let json = serde_json::Value::Object(
                attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            hasher.update(canonical_json(&json).as_bytes());
        }
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

fn spill_content(data_dir: &Path, content: &[u8]) -> std::io::Result<PathBuf> {
    let dir = data_dir.join(CONTENT_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.bin", uuid::Uuid::new_v4()));
    std::fs::write(&path, content)?;
    Ok(path)
}
