use crate::config::{parse_flag, ConfigSource};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const CORE_NAME: &str = "name";
pub const CORE_INSTDIR: &str = "instanceDir";
pub const CORE_CONFIG: &str = "config";
pub const CORE_SCHEMA: &str = "schema";
pub const CORE_DATADIR: &str = "dataDir";
pub const CORE_PROPERTIES: &str = "properties";
pub const CORE_TRANSIENT: &str = "transient";
pub const CORE_LOADONSTARTUP: &str = "loadOnStartup";
pub const CORE_SHARD: &str = "shard";
pub const CORE_COLLECTION: &str = "collection";
pub const CORE_ROLES: &str = "roles";
pub const CORE_NODE_NAME: &str = "coreNodeName";

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_SCHEMA_FILE: &str = "schema.json";
pub const DEFAULT_DATA_DIR: &str = "data";

/// Placement metadata, only populated when distributed coordination is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDescriptor {
    pub shard_id: Option<String>,
    pub collection_name: String,
    pub roles: Vec<String>,
    pub core_node_name: Option<String>,
}

/// Configuration record for one core.
///
/// Setters consume `self` and are only meant to be used before the core is
/// first loaded; once a descriptor is handed to the registry it is shared
/// behind an `Arc` and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreDescriptor {
    name: String,
    instance_dir: PathBuf,
    config_name: String,
    schema_name: String,
    data_dir: String,
    properties_name: Option<String>,
    transient: bool,
    load_on_startup: bool,
    properties: BTreeMap<String, String>,
    cloud: Option<CloudDescriptor>,
}

impl CoreDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        CoreDescriptor {
            instance_dir: PathBuf::from(&name),
            name,
            config_name: DEFAULT_CONFIG_FILE.to_string(),
            schema_name: DEFAULT_SCHEMA_FILE.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            properties_name: None,
            transient: false,
            load_on_startup: true,
            properties: BTreeMap::new(),
            cloud: None,
        }
    }

    /// Build the descriptor for configuration entry `entry`.
    ///
    /// Placement metadata is read only when `cloud_aware` is set.
    pub fn from_config(source: &dyn ConfigSource, entry: &str, cloud_aware: bool) -> Result<Self> {
        let name = source
            .core_property(entry, CORE_NAME)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "core entry {} is missing the required '{}' attribute",
                    entry, CORE_NAME
                ))
            })?;
        validate_core_name(&name).map_err(|e| CoreError::Config(e.to_string()))?;

        let prop = |key: &str| source.core_property(entry, key).filter(|v| !v.is_empty());
        let mut desc = CoreDescriptor::new(name.clone());
        if let Some(dir) = prop(CORE_INSTDIR) {
            desc.instance_dir = PathBuf::from(dir);
        }
        if let Some(config) = prop(CORE_CONFIG) {
            desc.config_name = config;
        }
        if let Some(schema) = prop(CORE_SCHEMA) {
            desc.schema_name = schema;
        }
        if let Some(data_dir) = prop(CORE_DATADIR) {
            desc.data_dir = data_dir;
        }
        desc.properties_name = prop(CORE_PROPERTIES);
        if let Some(v) = prop(CORE_TRANSIENT) {
            desc.transient = parse_flag(&v);
        }
        if let Some(v) = prop(CORE_LOADONSTARTUP) {
            desc.load_on_startup = parse_flag(&v);
        }
        desc.properties = source.core_properties(entry);

        if cloud_aware {
            desc.cloud = Some(CloudDescriptor {
                shard_id: prop(CORE_SHARD),
                collection_name: prop(CORE_COLLECTION).unwrap_or_else(|| name.clone()),
                roles: prop(CORE_ROLES)
                    .map(|r| {
                        r.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                core_node_name: prop(CORE_NODE_NAME),
            });
        }
        Ok(desc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_dir(&self) -> &std::path::Path {
        &self.instance_dir
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }

    pub fn properties_name(&self) -> Option<&str> {
        self.properties_name.as_deref()
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_load_on_startup(&self) -> bool {
        self.load_on_startup
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn cloud(&self) -> Option<&CloudDescriptor> {
        self.cloud.as_ref()
    }

    /// Collection this core belongs to; falls back to the core name.
    pub fn collection_name(&self) -> &str {
        self.cloud
            .as_ref()
            .map(|c| c.collection_name.as_str())
            .unwrap_or(&self.name)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_instance_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.instance_dir = dir.into();
        self
    }

    pub fn with_config_name(mut self, config: impl Into<String>) -> Self {
        self.config_name = config.into();
        self
    }

    pub fn with_schema_name(mut self, schema: impl Into<String>) -> Self {
        self.schema_name = schema.into();
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_load_on_startup(mut self, load: bool) -> Self {
        self.load_on_startup = load;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_cloud(mut self, cloud: CloudDescriptor) -> Self {
        self.cloud = Some(cloud);
        self
    }
}

/// Core names end up as directory and URL path segments.
pub fn validate_core_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidCoreName(
            "core name must not be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(CoreError::InvalidCoreName(format!(
            "invalid core name '{}': must not contain path separators",
            name
        )));
    }
    Ok(())
}
