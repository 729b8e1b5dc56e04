use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TLOG_FILE: &str = "tlog.jsonl";

/// One buffered update, written before it reaches the index writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TlogEntry {
    Add { doc: serde_json::Value },
    Delete { id: String },
}

/// Write-ahead log of uncommitted updates.
///
/// Files live at `{dir}/*.jsonl`, one JSON entry per line. Everything in
/// the directory is replayed on recovery and removed after a commit.
pub struct UpdateLog {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl UpdateLog {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(UpdateLog {
            dir: dir.to_path_buf(),
            append_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, entry: &TlogEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(TLOG_FILE))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn log_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Every entry across all log files, in file-name then line order.
    /// Unparseable lines (a torn final write) are skipped.
    pub fn pending_entries(&self) -> Result<Vec<TlogEntry>> {
        let mut entries = Vec::new();
        for path in self.log_files()? {
            let content = std::fs::read_to_string(&path)?;
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => tracing::warn!(
                        "[TLOG] skipping unreadable entry {}:{}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    ),
                }
            }
        }
        Ok(entries)
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for path in self.log_files()? {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_then_read_back_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(&tmp.path().join("tlog")).unwrap();
        log.append(&TlogEntry::Add {
            doc: json!({"id": "1"}),
        })
        .unwrap();
        log.append(&TlogEntry::Delete { id: "1".into() }).unwrap();

        let entries = log.pending_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], TlogEntry::Add { .. }));
        assert_eq!(entries[1], TlogEntry::Delete { id: "1".into() });
    }

    #[test]
    fn reads_every_jsonl_file_and_skips_torn_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tlog");
        let log = UpdateLog::open(&dir).unwrap();
        std::fs::write(
            dir.join("a.jsonl"),
            "{\"op\":\"delete\",\"id\":\"x\"}\n{\"op\":\"add\",\"doc\":{\"id\":\"y\"}}\n",
        )
        .unwrap();
        std::fs::write(dir.join("b.jsonl"), "{\"op\":\"delete\",\"id\":\"z\"}\n{\"op\":").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let entries = log.pending_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], TlogEntry::Delete { id: "z".into() });
    }

    #[test]
    fn clear_removes_log_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tlog");
        let log = UpdateLog::open(&dir).unwrap();
        log.append(&TlogEntry::Delete { id: "1".into() }).unwrap();
        std::fs::write(dir.join("keep.txt"), "x").unwrap();

        log.clear().unwrap();
        assert!(log.pending_entries().unwrap().is_empty());
        assert!(dir.join("keep.txt").exists());
    }
}
