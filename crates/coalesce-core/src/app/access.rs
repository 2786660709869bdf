//! RecordAccess - 1 token 分の Queue Record への読み書き
//!
//! # 設計原則
//! - キャッシュしない: 毎回ストアから読み直す（別ハンドルや前回プロセスの書き込みも見える）
//! - load→modify→save は同一プロセス内で直列化する
//!   （producer はどのスレッドからでも push するため）

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::app::SchedulerConfig;
use crate::domain::{QueueRecord, StoreError};
use crate::ports::{Clock, RecordStore};

/// Store, clock and config bundled for one token.
///
/// Clones share one write guard, so every read-modify-write made through
/// any clone is atomic with respect to the others.
#[derive(Clone)]
pub struct RecordAccess {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    write_guard: Arc<Mutex<()>>,
}

impl RecordAccess {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn token(&self) -> &str {
        &self.config.token
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn load(&self) -> Result<Option<QueueRecord>, StoreError> {
        self.store.get(self.token())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the existing record and write it back.
    ///
    /// Returns `Ok(None)` without writing when no record exists.
    pub fn update_existing<T>(
        &self,
        f: impl FnOnce(&mut QueueRecord) -> T,
    ) -> Result<Option<T>, StoreError> {
        let _guard = self.guard();
        let Some(mut record) = self.load()? else {
            return Ok(None);
        };
        let out = f(&mut record);
        self.store.set(self.token(), &record)?;
        Ok(Some(out))
    }

    /// Like [`update_existing`](Self::update_existing), but writes only when
    /// `f` returns `Some`.
    pub fn try_update<T>(
        &self,
        f: impl FnOnce(&mut QueueRecord) -> Option<T>,
    ) -> Result<Option<T>, StoreError> {
        let _guard = self.guard();
        let Some(mut record) = self.load()? else {
            return Ok(None);
        };
        let Some(out) = f(&mut record) else {
            return Ok(None);
        };
        self.store.set(self.token(), &record)?;
        Ok(Some(out))
    }

    /// Apply `f` to the record, creating a fresh one due now if absent.
    pub fn update_or_create<T>(
        &self,
        f: impl FnOnce(&mut QueueRecord) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.guard();
        let mut record = match self.load()? {
            Some(record) => record,
            None => QueueRecord::new(self.now()),
        };
        let out = f(&mut record);
        self.store.set(self.token(), &record)?;
        Ok(out)
    }
}
