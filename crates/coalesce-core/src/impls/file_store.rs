//! JsonFileStore - token ごとの JSON ファイルに保存する RecordStore
//!
//! 1 token = 1 ファイル（pretty JSON）:
//! ```text
//! {dir}/
//! ├── schedule@formIdCollector.json
//! └── other_token.json
//! ```
//! 書き込みは一時ファイル → rename。書き込み途中で落ちても直前の record が残る。

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::domain::{QueueRecord, StoreError};
use crate::ports::RecordStore;

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "json file store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the record for `token`.
    pub fn record_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(token)))
    }
}

/// Map a token onto a safe file name.
fn file_stem(token: &str) -> String {
    let stem: String = token
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        format!("_{stem}")
    } else {
        stem
    }
}

impl RecordStore for JsonFileStore {
    fn get(&self, token: &str) -> Result<Option<QueueRecord>, StoreError> {
        let path = self.record_path(token);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let record = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    fn set(&self, token: &str, record: &QueueRecord) -> Result<(), StoreError> {
        let path = self.record_path(token);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        debug!(token, tasks = record.len(), locked = record.locked, "record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId};
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.get("schedule@formIdCollector").unwrap().is_none());
    }

    #[test]
    fn record_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut record = QueueRecord::new(1_234);
        record.append(Task::new(TaskId::new("a"), serde_json::json!({ "formId": "x" })));

        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.set("schedule@formIdCollector", &record).unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        let loaded = reopened.get("schedule@formIdCollector").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(!reopened.record_path("schedule@formIdCollector").with_extension("json.tmp").exists());
    }

    #[test]
    fn garbage_file_is_a_serde_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        fs::write(store.record_path("t"), "{ not json").unwrap();

        let err = store.get("t").unwrap_err();
        assert!(matches!(err, StoreError::Serde(_)));
    }

    #[test]
    fn tokens_are_sanitized_into_file_names() {
        assert_eq!(file_stem("schedule@formIdCollector"), "schedule@formIdCollector");
        assert_eq!(file_stem("../etc/passwd"), ".._etc_passwd");
        assert_eq!(file_stem(".."), "_..");
        assert_eq!(file_stem(""), "_");
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = JsonFileStore::open(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.dir(), nested.as_path());
    }
}
