//! QueueRecord - 1 token 分の永続化されたスケジュール状態
//!
//! `{ nextFireAt, locked, tasks }` をそのまま JSON で保存する。
//! 旧形式のキー（`cd`）も読める。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{Task, TaskId};

/// Schedule state persisted under one store token.
///
/// Design:
/// - This is the single source of truth for the queue; the scheduler keeps no
///   copy of it between cycles.
/// - Every field has a serde default so that a partially written or legacy
///   record still loads. A missing `nextFireAt` reads as 0, i.e. "due now".
/// - `tasks` keeps arrival order; the oldest task is reported first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    /// Earliest time (ms since epoch) the scheduler may fire.
    #[serde(default, alias = "cd")]
    pub next_fire_at: i64,

    /// Advisory lock, set while a batch is being reported.
    #[serde(default)]
    pub locked: bool,

    /// Pending tasks in arrival order.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl QueueRecord {
    /// Fresh, unlocked record that is due at `next_fire_at`.
    pub fn new(next_fire_at: i64) -> Self {
        Self {
            next_fire_at,
            locked: false,
            tasks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.iter().any(|t| t.id() == id)
    }

    /// Append a task (allowed even while locked).
    pub fn append(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Remove every task whose id is in `ids`. Returns how many were removed.
    ///
    /// Tasks not mentioned in `ids` (for example, ones pushed while a batch
    /// was in flight) keep their position.
    pub fn remove_ids<'a, I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let ids: HashSet<&TaskId> = ids.into_iter().collect();
        if ids.is_empty() {
            return 0;
        }
        let before = self.tasks.len();
        self.tasks.retain(|t| !ids.contains(t.id()));
        before - self.tasks.len()
    }

    /// Reset to empty and unlocked, next due at `next_fire_at`.
    pub fn reset(&mut self, next_fire_at: i64) {
        self.tasks.clear();
        self.locked = false;
        self.next_fire_at = next_fire_at;
    }

    /// Is the fire time reached at `now`?
    pub fn is_due(&self, now: i64) -> bool {
        self.next_fire_at <= now
    }

    /// Is the lock older than `max_spend_ms` past the planned fire time?
    pub fn is_lock_stale(&self, now: i64, max_spend_ms: i64) -> bool {
        self.locked && now.saturating_sub(self.next_fire_at) > max_spend_ms
    }
}
