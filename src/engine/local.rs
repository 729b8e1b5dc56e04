use super::tlog::{TlogEntry, UpdateLog};
use super::{CoreEngine, CoreFactory};
use crate::error::{CoreError, Result};
use crate::resource::{CoreContext, FieldDef, FieldType, IndexSchema};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tantivy::directory::MmapDirectory;
use tantivy::schema::{Field, NumericOptions, Schema, TextOptions, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term};

pub const INDEX_DIR: &str = "index";
pub const TLOG_DIR: &str = "tlog";

/// tantivy refuses writer budgets below this per thread.
const MIN_WRITER_HEAP_BYTES: usize = 15_000_000;

/// Builds [`TantivyEngine`]s rooted at `{instanceDir}/{dataDir}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TantivyCoreFactory;

impl CoreFactory for TantivyCoreFactory {
    fn create(&self, ctx: &CoreContext) -> Result<Box<dyn CoreEngine>> {
        Ok(Box::new(TantivyEngine::open_index(ctx)?))
    }
}

/// On-disk index state shared by an engine and the engines reloaded from it.
struct SharedIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    unique_key: Field,
    definition: Arc<IndexSchema>,
    tlog: Option<UpdateLog>,
    writer_heap_bytes: usize,
    /// Engines that have not been closed yet.
    holders: AtomicUsize,
}

pub struct TantivyEngine {
    name: String,
    shared: Arc<SharedIndex>,
    recovery_cancelled: AtomicBool,
    closed: AtomicBool,
}

impl TantivyEngine {
    pub fn open_index(ctx: &CoreContext) -> Result<Self> {
        let name = ctx.descriptor.name().to_string();
        let data_dir = ctx.data_dir();
        let index_dir = data_dir.join(INDEX_DIR);
        std::fs::create_dir_all(&index_dir)?;

        let schema = build_schema(&ctx.schema)?;
        let directory = MmapDirectory::open(&index_dir)
            .map_err(|e| CoreError::Engine(format!("cannot open {}: {}", index_dir.display(), e)))?;
        let index = Index::open_or_create(directory, schema.clone())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let unique_key = schema.get_field(&ctx.schema.unique_key)?;
        let tlog = if ctx.config.update_log {
            Some(UpdateLog::open(&data_dir.join(TLOG_DIR))?)
        } else {
            None
        };
        tracing::debug!("[ENGINE {}] opened index at {}", name, index_dir.display());

        Ok(TantivyEngine {
            name,
            shared: Arc::new(SharedIndex {
                index,
                reader,
                writer: Mutex::new(None),
                unique_key,
                definition: Arc::clone(&ctx.schema),
                tlog,
                writer_heap_bytes: ctx.config.writer_heap_bytes.max(MIN_WRITER_HEAP_BYTES),
                holders: AtomicUsize::new(1),
            }),
            recovery_cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> &Index {
        &self.shared.index
    }

    pub fn searcher(&self) -> Searcher {
        self.shared.reader.searcher()
    }

    pub fn num_docs(&self) -> u64 {
        self.searcher().num_docs()
    }

    fn writer(&self) -> Result<MutexGuard<'_, Option<IndexWriter>>> {
        let mut guard = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let writer = self
                .shared
                .index
                .writer_with_num_threads(1, self.shared.writer_heap_bytes)?;
            *guard = Some(writer);
        }
        Ok(guard)
    }

    fn parse_document(&self, value: &serde_json::Value) -> Result<(String, TantivyDocument)> {
        let key = &self.shared.definition.unique_key;
        let id = value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CoreError::Engine(format!("document is missing unique key '{}'", key))
            })?
            .to_string();
        let doc = TantivyDocument::parse_json(&self.shared.index.schema(), &value.to_string())
            .map_err(|e| CoreError::Engine(format!("invalid document {}: {}", id, e)))?;
        Ok((id, doc))
    }

    /// Add or replace a document. Visible after the next [`commit`].
    ///
    /// [`commit`]: TantivyEngine::commit
    pub fn add_json(&self, json: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let (id, doc) = self.parse_document(&value)?;
        // Log append and write share the writer lock that commit clears under.
        let mut guard = self.writer()?;
        if let Some(tlog) = &self.shared.tlog {
            tlog.append(&TlogEntry::Add { doc: value })?;
        }
        if let Some(writer) = guard.as_mut() {
            writer.delete_term(Term::from_field_text(self.shared.unique_key, &id));
            writer.add_document(doc)?;
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.writer()?;
        if let Some(tlog) = &self.shared.tlog {
            tlog.append(&TlogEntry::Delete { id: id.to_string() })?;
        }
        if let Some(writer) = guard.as_mut() {
            writer.delete_term(Term::from_field_text(self.shared.unique_key, id));
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut guard = self.writer()?;
        if let Some(writer) = guard.as_mut() {
            writer.commit()?;
        }
        self.shared.reader.reload()?;
        if let Some(tlog) = &self.shared.tlog {
            tlog.clear()?;
        }
        Ok(())
    }
}

impl CoreEngine for TantivyEngine {
    fn open(&self) -> Result<()> {
        self.shared.reader.reload()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.holders.fetch_sub(1, Ordering::SeqCst) > 1 {
            // A reloaded engine still uses the index.
            return Ok(());
        }
        let writer = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            writer.commit()?;
            writer.wait_merging_threads()?;
            if let Some(tlog) = &self.shared.tlog {
                tlog.clear()?;
            }
        }
        tracing::debug!("[ENGINE {}] index closed", self.name);
        Ok(())
    }

    fn reload(&self, ctx: &CoreContext) -> Result<Box<dyn CoreEngine>> {
        if *ctx.schema != *self.shared.definition {
            return Err(CoreError::Config(format!(
                "schema of core {} changed; the index must be recreated to apply it",
                self.name
            )));
        }
        self.shared.holders.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TantivyEngine {
            name: ctx.descriptor.name().to_string(),
            shared: Arc::clone(&self.shared),
            recovery_cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn has_update_log(&self) -> bool {
        self.shared.tlog.is_some()
    }

    fn recover_from_log(&self) -> Result<usize> {
        let Some(tlog) = &self.shared.tlog else {
            return Ok(0);
        };
        let entries = tlog.pending_entries()?;
        if entries.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            "[RECOVERY {}] replaying {} buffered updates from {}",
            self.name,
            entries.len(),
            tlog.dir().display()
        );

        let mut guard = self.writer()?;
        let Some(writer) = guard.as_mut() else {
            return Ok(0);
        };
        let mut replayed = 0usize;
        for entry in &entries {
            if self.recovery_cancelled.load(Ordering::SeqCst) {
                writer.rollback()?;
                return Err(CoreError::ServiceUnavailable(format!(
                    "recovery of core {} cancelled after {} updates",
                    self.name, replayed
                )));
            }
            match entry {
                TlogEntry::Add { doc } => match self.parse_document(doc) {
                    Ok((id, doc)) => {
                        writer.delete_term(Term::from_field_text(self.shared.unique_key, &id));
                        writer.add_document(doc)?;
                        replayed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("[RECOVERY {}] skipping entry: {}", self.name, e);
                    }
                },
                TlogEntry::Delete { id } => {
                    writer.delete_term(Term::from_field_text(self.shared.unique_key, id));
                    replayed += 1;
                }
            }
        }
        writer.commit()?;
        drop(guard);
        self.shared.reader.reload()?;
        tlog.clear()?;
        Ok(replayed)
    }

    fn cancel_recovery(&self) {
        self.recovery_cancelled.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn build_schema(def: &IndexSchema) -> Result<Schema> {
    def.validate()?;
    let mut builder = Schema::builder();
    for f in &def.fields {
        match f.field_type {
            FieldType::Text => {
                builder.add_text_field(&f.name, text_options(TEXT, f));
            }
            FieldType::String => {
                builder.add_text_field(&f.name, text_options(STRING, f));
            }
            FieldType::U64 => {
                builder.add_u64_field(&f.name, numeric_options(f));
            }
            FieldType::I64 => {
                builder.add_i64_field(&f.name, numeric_options(f));
            }
            FieldType::F64 => {
                builder.add_f64_field(&f.name, numeric_options(f));
            }
        }
    }
    Ok(builder.build())
}

fn text_options(indexed: TextOptions, f: &FieldDef) -> TextOptions {
    let opts = if f.indexed {
        indexed
    } else {
        TextOptions::default()
    };
    if f.stored {
        opts.set_stored()
    } else {
        opts
    }
}

fn numeric_options(f: &FieldDef) -> NumericOptions {
    let mut opts = NumericOptions::default();
    if f.indexed {
        opts = opts.set_indexed();
    }
    if f.stored {
        opts = opts.set_stored();
    }
    opts
}
