//! LockManager - Queue Record のアドバイザリロック
//!
//! # 設計原則
//! - ロックは協調的なフラグ: 同一 token の正しく振る舞う drain 同士を分けるだけ
//! - 判定と書き込みは 1 回の read-modify-write で行う（同一プロセス内では原子的）
//! - クラッシュで残ったロックは `kill_dead` で回収する（stale lock）

use tracing::warn;

use crate::app::RecordAccess;
use crate::domain::{StoreError, Task};

/// Takes and recovers the `locked` flag.
///
/// The flag keeps well-behaved drains of the same token apart, including
/// across restarts. It is not a mutex between processes sharing one store.
#[derive(Clone)]
pub struct LockManager {
    access: RecordAccess,
}

impl LockManager {
    pub fn new(access: RecordAccess) -> Self {
        Self { access }
    }

    /// Set the flag. Does nothing (and returns `false`) when no record exists.
    pub fn lock(&self, locked: bool) -> Result<bool, StoreError> {
        let done = self.access.update_existing(|r| r.locked = locked)?;
        Ok(done.is_some())
    }

    /// Lock the record, creating it if needed. `false` if it was already locked.
    pub fn acquire(&self) -> Result<bool, StoreError> {
        self.access.update_or_create(|r| {
            if r.locked {
                false
            } else {
                r.locked = true;
                true
            }
        })
    }

    /// Lock the record and take a snapshot of its tasks.
    ///
    /// `None` (and no write) when the record is missing, empty or locked.
    pub fn acquire_batch(&self) -> Result<Option<Vec<Task>>, StoreError> {
        self.access.try_update(|r| {
            if r.locked || r.is_empty() {
                return None;
            }
            r.locked = true;
            Some(r.tasks.clone())
        })
    }

    /// Clear a lock that has outlived any healthy drain.
    ///
    /// A lock is stale when `now - nextFireAt > max(interval, timeout, retryTime)`;
    /// that is what a crash in the middle of a report leaves behind. Returns
    /// whether a stale lock was cleared.
    pub fn kill_dead(&self) -> Result<bool, StoreError> {
        let now = self.access.now();
        let max_spend = self.access.config().max_spend_ms();
        let cleared = self.access.try_update(|r| {
            if !r.is_lock_stale(now, max_spend) {
                return None;
            }
            r.locked = false;
            Some(r.next_fire_at)
        })?;

        if let Some(next_fire_at) = cleared {
            warn!(
                token = self.access.token(),
                next_fire_at,
                age_ms = now.saturating_sub(next_fire_at),
                max_spend_ms = max_spend,
                "cleared stale lock"
            );
        }
        Ok(cleared.is_some())
    }
}
