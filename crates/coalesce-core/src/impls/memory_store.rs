//! InMemoryStore - プロセス内の RecordStore
//!
//! テストや、永続化をホスト側に任せる組み込み用途向け。
//! プロセスが落ちれば中身も消える。

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{QueueRecord, StoreError};
use crate::ports::RecordStore;

/// InMemoryStore は token ごとに QueueRecord を 1 つ保持する
///
/// # 実装詳細
/// - HashMap<String, QueueRecord> を Mutex で保護
/// - get/set は短時間でロックを手放す（await を跨がない）
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, QueueRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens with a stored record.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for InMemoryStore {
    fn get(&self, token: &str) -> Result<Option<QueueRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(token).cloned())
    }

    fn set(&self, token: &str, record: &QueueRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(token.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId};

    #[test]
    fn get_missing_token_is_none() {
        let store = InMemoryStore::new();
        assert!(store.get("nope").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn set_then_get_returns_latest_write() {
        let store = InMemoryStore::new();
        let mut record = QueueRecord::new(10);
        store.set("t", &record).unwrap();

        record.append(Task::new(TaskId::new("a"), serde_json::json!(1)));
        record.locked = true;
        store.set("t", &record).unwrap();

        let loaded = store.get("t").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn tokens_are_independent() {
        let store = InMemoryStore::new();
        store.set("one", &QueueRecord::new(1)).unwrap();
        store.set("two", &QueueRecord::new(2)).unwrap();

        assert_eq!(store.get("one").unwrap().unwrap().next_fire_at, 1);
        assert_eq!(store.get("two").unwrap().unwrap().next_fire_at, 2);
    }
}
