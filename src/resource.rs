use crate::descriptor::CoreDescriptor;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONF_DIR: &str = "conf";
pub const CONFIGSETS_DIR: &str = "configsets";

const DEFAULT_WRITER_HEAP_BYTES: usize = 50_000_000;

fn default_writer_heap_bytes() -> usize {
    DEFAULT_WRITER_HEAP_BYTES
}

fn default_true() -> bool {
    true
}

fn default_unique_key() -> String {
    "id".to_string()
}

/// Per-core engine configuration, read from `conf/{config}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default = "default_writer_heap_bytes")]
    pub writer_heap_bytes: usize,
    #[serde(default = "default_true")]
    pub update_log: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            writer_heap_bytes: DEFAULT_WRITER_HEAP_BYTES,
            update_log: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    String,
    U64,
    I64,
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub stored: bool,
    #[serde(default = "default_true")]
    pub indexed: bool,
}

impl FieldDef {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        FieldDef {
            name: name.to_string(),
            field_type,
            stored: true,
            indexed: true,
        }
    }
}

/// Field layout of a core, read from `conf/{schema}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub fields: Vec<FieldDef>,
    #[serde(default = "default_unique_key")]
    pub unique_key: String,
}

impl Default for IndexSchema {
    fn default() -> Self {
        IndexSchema {
            fields: vec![
                FieldDef::new("id", FieldType::String),
                FieldDef::new("text", FieldType::Text),
            ],
            unique_key: default_unique_key(),
        }
    }
}

impl IndexSchema {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for f in &self.fields {
            if f.name.is_empty() {
                return Err(CoreError::Config("schema field with empty name".into()));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate schema field '{}'",
                    f.name
                )));
            }
        }
        match self.fields.iter().find(|f| f.name == self.unique_key) {
            Some(f) if f.field_type == FieldType::String && f.indexed => Ok(()),
            Some(_) => Err(CoreError::Config(format!(
                "unique key '{}' must be an indexed string field",
                self.unique_key
            ))),
            None => Err(CoreError::Config(format!(
                "unique key '{}' is not a schema field",
                self.unique_key
            ))),
        }
    }
}

/// Everything an engine needs to build or rebuild one core.
#[derive(Debug, Clone)]
pub struct CoreContext {
    pub descriptor: Arc<CoreDescriptor>,
    /// Absolute instance directory.
    pub instance_dir: PathBuf,
    /// Config set resolved from the coordination layer, if any.
    pub config_set: Option<String>,
    pub config: Arc<CoreConfig>,
    pub schema: Arc<IndexSchema>,
}

impl CoreContext {
    pub fn data_dir(&self) -> PathBuf {
        self.instance_dir.join(self.descriptor.data_dir())
    }
}

/// Resolves and parses per-core config and schema files.
pub struct ResourceLoader {
    home: PathBuf,
    schema_cache: Option<DashMap<String, Arc<IndexSchema>>>,
}

impl ResourceLoader {
    pub fn new(home: impl Into<PathBuf>, share_schema: bool) -> Self {
        ResourceLoader {
            home: home.into(),
            schema_cache: share_schema.then(DashMap::new),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Instance directories are resolved against the container home.
    pub fn resolve_instance_dir(&self, descriptor: &CoreDescriptor) -> PathBuf {
        let dir = descriptor.instance_dir();
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.home.join(dir)
        }
    }

    /// `{home}/configsets/{set}` when a config set is given, else
    /// `{instance_dir}/conf`.
    pub fn conf_dir(&self, instance_dir: &Path, config_set: Option<&str>) -> PathBuf {
        match config_set {
            Some(set) => self.home.join(CONFIGSETS_DIR).join(set),
            None => instance_dir.join(CONF_DIR),
        }
    }

    pub fn load_context(
        &self,
        descriptor: Arc<CoreDescriptor>,
        config_set: Option<String>,
    ) -> Result<CoreContext> {
        let instance_dir = self.resolve_instance_dir(&descriptor);
        let conf_dir = self.conf_dir(&instance_dir, config_set.as_deref());
        let config = load_config(&conf_dir.join(descriptor.config_name()))?;
        let schema = self.load_schema(&conf_dir.join(descriptor.schema_name()))?;
        Ok(CoreContext {
            descriptor,
            instance_dir,
            config_set,
            config: Arc::new(config),
            schema,
        })
    }

    fn load_schema(&self, path: &Path) -> Result<Arc<IndexSchema>> {
        if !path.exists() {
            return Ok(Arc::new(IndexSchema::default()));
        }
        let Some(cache) = &self.schema_cache else {
            return Ok(Arc::new(parse_schema(path)?));
        };
        let key = schema_cache_key(path)?;
        if let Some(schema) = cache.get(&key) {
            tracing::debug!("[SCHEMA] reusing shared schema {}", key);
            return Ok(Arc::clone(schema.value()));
        }
        let schema = Arc::new(parse_schema(path)?);
        Ok(Arc::clone(cache.entry(key).or_insert(schema).value()))
    }

    pub fn cached_schema_count(&self) -> usize {
        self.schema_cache.as_ref().map(|c| c.len()).unwrap_or(0)
    }
}

fn load_config(path: &Path) -> Result<CoreConfig> {
    if !path.exists() {
        return Ok(CoreConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| CoreError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

fn parse_schema(path: &Path) -> Result<IndexSchema> {
    let content = std::fs::read_to_string(path)?;
    let schema: IndexSchema = serde_json::from_str(&content)
        .map_err(|e| CoreError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    schema.validate()?;
    Ok(schema)
}

/// `{canonical path}:{mtime as yyyyMMddHHmmss}`. Editing the file yields a
/// new key, so a stale schema is never served.
pub fn schema_cache_key(path: &Path) -> Result<String> {
    let canonical = path.canonicalize()?;
    let modified: DateTime<Utc> = std::fs::metadata(&canonical)?.modified()?.into();
    Ok(format!(
        "{}:{}",
        canonical.display(),
        modified.format("%Y%m%d%H%M%S")
    ))
}
