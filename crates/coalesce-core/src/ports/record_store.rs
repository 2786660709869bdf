//! RecordStore port - Queue Record を保存するキーバリューストア
//!
//! ホスト側のストレージ（端末ローカルの KV、ファイル、など）を
//! 「token で引ける 1 レコード」の get/set だけに絞った窓口。
//!
//! # 設計原則
//! - 同期 API（保持中に await を跨がない）
//! - トランザクションなし、last-write-wins
//! - 部分書き込みは想定しない（set は丸ごと置き換え）

use std::sync::Arc;

use crate::domain::{QueueRecord, StoreError};

pub trait RecordStore: Send + Sync {
    /// Load the record stored under `token`, if any.
    fn get(&self, token: &str) -> Result<Option<QueueRecord>, StoreError>;

    /// Replace the record stored under `token`.
    fn set(&self, token: &str, record: &QueueRecord) -> Result<(), StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn get(&self, token: &str) -> Result<Option<QueueRecord>, StoreError> {
        (**self).get(token)
    }

    fn set(&self, token: &str, record: &QueueRecord) -> Result<(), StoreError> {
        (**self).set(token, record)
    }
}
