use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "cores.json";
pub const DEFAULT_DEFAULT_CORE_NAME: &str = "collection1";
const DEFAULT_CORE_LOAD_THREADS: usize = 3;
const DEFAULT_CLOSER_JOIN_TIMEOUT_MS: u64 = 30_000;

fn default_core_load_threads() -> usize {
    DEFAULT_CORE_LOAD_THREADS
}

fn default_transient_cache_size() -> usize {
    usize::MAX
}

fn default_core_name() -> String {
    DEFAULT_DEFAULT_CORE_NAME.to_string()
}

fn default_closer_join_timeout_ms() -> u64 {
    DEFAULT_CLOSER_JOIN_TIMEOUT_MS
}

/// Container-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    #[serde(default = "default_core_load_threads")]
    pub core_load_threads: usize,
    /// Capacity of the transient core cache. Defaults to effectively unbounded.
    #[serde(default = "default_transient_cache_size")]
    pub transient_cache_size: usize,
    #[serde(default = "default_core_name")]
    pub default_core_name: String,
    #[serde(default)]
    pub share_schema: bool,
    #[serde(default = "default_closer_join_timeout_ms")]
    pub closer_join_timeout_ms: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        ContainerSettings {
            core_load_threads: DEFAULT_CORE_LOAD_THREADS,
            transient_cache_size: usize::MAX,
            default_core_name: DEFAULT_DEFAULT_CORE_NAME.to_string(),
            share_schema: false,
            closer_join_timeout_ms: DEFAULT_CLOSER_JOIN_TIMEOUT_MS,
        }
    }
}

impl ContainerSettings {
    /// Overlay `COREHOST_*` environment variables on top of these settings.
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env::var("COREHOST_CORE_LOAD_THREADS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.core_load_threads = n;
        }
        if let Some(n) = env::var("COREHOST_TRANSIENT_CACHE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.transient_cache_size = n;
        }
        if let Ok(name) = env::var("COREHOST_DEFAULT_CORE_NAME") {
            if !name.is_empty() {
                self.default_core_name = name;
            }
        }
        if let Ok(v) = env::var("COREHOST_SHARE_SCHEMA") {
            self.share_schema = parse_flag(&v);
        }
        self
    }
}

/// One core entry as written in `cores.json`.
///
/// Top-level keys are the raw core attributes (`name`, `instanceDir`,
/// `transient`, ...). `coreProperties` is the free-form property bag
/// handed to the core untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreEntry {
    #[serde(default)]
    pub core_properties: BTreeMap<String, String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl CoreEntry {
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.get(key).and_then(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }
}

/// Normalized container configuration: global settings plus core entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(flatten)]
    pub settings: ContainerSettings,
    #[serde(default)]
    pub cores: Vec<CoreEntry>,
}

impl ContainerConfig {
    /// Defaults with `COREHOST_*` overrides and no configured cores.
    pub fn from_env() -> Self {
        ContainerConfig {
            settings: ContainerSettings::default().with_env_overrides(),
            cores: Vec::new(),
        }
    }

    /// Load `{home}/cores.json`, or defaults when the file does not exist.
    pub fn load_or_default(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::info!(
                "No {} found in {}, starting with no configured cores",
                CONFIG_FILE_NAME,
                home.display()
            );
            return Ok(ContainerConfig::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: ContainerConfig = serde_json::from_str(&content).map_err(|e| {
            CoreError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        tracing::info!(
            "Loaded container config: cores={}, coreLoadThreads={}, transientCacheSize={}",
            config.cores.len(),
            config.settings.core_load_threads,
            config.settings.transient_cache_size
        );
        Ok(config)
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(home.join(CONFIG_FILE_NAME), json)?;
        Ok(())
    }

    pub fn with_core(mut self, entry: CoreEntry) -> Self {
        self.cores.push(entry);
        self
    }

    fn entry_id(index: usize, entry: &CoreEntry) -> String {
        entry
            .attribute(crate::descriptor::CORE_NAME)
            .unwrap_or_else(|| format!("#{}", index))
    }

    fn entry(&self, id: &str) -> Option<&CoreEntry> {
        self.cores
            .iter()
            .enumerate()
            .find(|(i, e)| Self::entry_id(*i, e) == id)
            .map(|(_, e)| e)
    }
}

/// The configuration collaborator the container reads cores from.
pub trait ConfigSource: Send + Sync {
    /// Identifiers of every configured core entry, in declaration order.
    fn all_core_names(&self) -> Vec<String>;

    fn core_property(&self, core: &str, key: &str) -> Option<String>;

    fn core_properties(&self, core: &str) -> BTreeMap<String, String>;

    fn settings(&self) -> &ContainerSettings;
}

impl ConfigSource for ContainerConfig {
    fn all_core_names(&self) -> Vec<String> {
        self.cores
            .iter()
            .enumerate()
            .map(|(i, e)| Self::entry_id(i, e))
            .collect()
    }

    fn core_property(&self, core: &str, key: &str) -> Option<String> {
        self.entry(core).and_then(|e| e.attribute(key))
    }

    fn core_properties(&self, core: &str) -> BTreeMap<String, String> {
        self.entry(core)
            .map(|e| e.core_properties.clone())
            .unwrap_or_default()
    }

    fn settings(&self) -> &ContainerSettings {
        &self.settings
    }
}

/// `true`/`on` (any case) are true, everything else is false.
pub fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("on")
}
