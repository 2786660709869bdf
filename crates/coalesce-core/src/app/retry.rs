//! RetryPlanner - 次回発火時刻（nextFireAt）の計画
//!
//! # 設計原則
//! - 固定バックオフ: 失敗なら `retry_time` 後、成功なら `interval` 後
//! - ロックは見ない: ロック中でもリトライは必ず計画できる
//! - 時刻計算（`*_at`）と永続化（`plan*`）を分け、スケジューラが
//!   1 回の書き込みにまとめられるようにする

use crate::app::RecordAccess;
use crate::domain::StoreError;

/// Writes `nextFireAt` into the queue record.
#[derive(Clone)]
pub struct RetryPlanner {
    access: RecordAccess,
}

impl RetryPlanner {
    pub fn new(access: RecordAccess) -> Self {
        Self { access }
    }

    /// `now + delay_ms`; a missing or negative delay falls back to `interval`.
    pub fn fire_at(&self, delay_ms: Option<i64>) -> i64 {
        let delay = match delay_ms {
            Some(ms) if ms >= 0 => ms,
            _ => self.access.config().interval_ms as i64,
        };
        self.access.now().saturating_add(delay)
    }

    /// Fire time of the next regular drain.
    pub fn interval_at(&self) -> i64 {
        self.fire_at(None)
    }

    /// Fire time of a retry.
    pub fn retry_at(&self) -> i64 {
        self.fire_at(Some(self.access.config().retry_time_ms as i64))
    }

    /// Persist `nextFireAt = now + delay_ms`, creating the record if needed.
    ///
    /// Returns the planned fire time.
    pub fn plan(&self, delay_ms: Option<i64>) -> Result<i64, StoreError> {
        let fire_at = self.fire_at(delay_ms);
        self.access.update_or_create(|r| r.next_fire_at = fire_at)?;
        Ok(fire_at)
    }
}
