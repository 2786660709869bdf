//! Scheduler - キューに溜まったタスクをバッチで報告するループ
//!
//! # 1 サイクルの流れ
//! 1. stale lock があれば回収
//! 2. record を読む。空・ロック中・ハンドラ未登録なら `interval` 後に再ポーリング
//! 3. `nextFireAt` まで待つ（ただし最大 `interval`）
//! 4. ロックを取りつつタスクをスナップショットし、報告
//! 5. 成功: スナップショット分を削除、`+interval` を計画、アンロック（1 回の書き込み）
//! 6. 失敗: アンロック、`+retryTime` を計画（1 回の書き込み）して 1 に戻る
//!
//! # 設計原則
//! - push は追記するだけでループを起こさない（連続 push は 1 バッチにまとまる）
//! - record の read-modify-write は RecordAccess が直列化する（どのスレッドから push してもよい）
//! - 報告中の future が drop されても、ロックは解放されリトライが計画される

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::app::handler::{Batch, BatchHandler, HandlerRegistry};
use crate::app::reporter::{Reporter, cancelled};
use crate::app::{LockManager, RecordAccess, RetryPlanner, SchedulerBuilder, SchedulerConfig};
use crate::domain::{QueueRecord, SchedulerError, SchedulerState, StoreError, Task, TaskId};
use crate::ports::IdGenerator;

/// Result of one drain that reached the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// The batch was accepted by every handler and removed from the queue.
    Reported { count: usize, next_fire_at: i64 },

    /// The report failed; the tasks stay queued and a retry is planned.
    Retrying { error: String, next_fire_at: i64 },
}

/// What `Scheduler::report` did with the payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    /// Every handler accepted the batch.
    Reported { count: usize },

    /// A drain was busy (or nothing is registered yet), so the payloads were
    /// queued for the next regular drain.
    Queued { ids: Vec<TaskId> },

    /// The report failed; the payloads were queued and a retry is planned.
    Retrying { ids: Vec<TaskId>, error: String },

    /// Nothing to report.
    Skipped,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct Inner {
    access: RecordAccess,
    locks: LockManager,
    planner: RetryPlanner,
    reporter: Reporter,
    ids: Arc<dyn IdGenerator>,
    handlers: RwLock<HandlerRegistry>,
    /// Serializes drains inside this process (loop vs. `report`).
    drain_gate: tokio::sync::Mutex<()>,
    state: watch::Sender<SchedulerState>,
    running: Mutex<Option<Running>>,
}

/// Batched task scheduler for one store token.
///
/// Cheap to clone; every clone drives the same queue. Build one with
/// [`Scheduler::builder`] and hand clones to producers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn from_parts(
        access: RecordAccess,
        ids: Arc<dyn IdGenerator>,
        handlers: HandlerRegistry,
    ) -> Self {
        let config = access.config();
        let reporter = Reporter::new(config.timeout());
        let (state, _) = watch::channel(SchedulerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                locks: LockManager::new(access.clone()),
                planner: RetryPlanner::new(access.clone()),
                access,
                reporter,
                ids,
                handlers: RwLock::new(handlers),
                drain_gate: tokio::sync::Mutex::new(()),
                state,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.inner.access.config()
    }

    /// Current time of the scheduler's clock, epoch millis.
    pub fn now_millis(&self) -> i64 {
        self.inner.access.now()
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// Watch loop state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running()
            .as_ref()
            .is_some_and(|r| !r.join.is_finished())
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// Returns `false` if the loop is already running.
    pub fn start(&self) -> bool {
        let mut running = self.inner.running();
        if running.as_ref().is_some_and(|r| !r.join.is_finished()) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let span = info_span!("scheduler", token = %self.config().token);
        inner.set_state(SchedulerState::Idle);
        let join = tokio::spawn(inner.run_loop(shutdown_rx).instrument(span));
        *running = Some(Running { shutdown_tx, join });

        info!(
            token = %self.config().token,
            interval_ms = self.config().interval_ms,
            timeout_ms = self.config().timeout_ms,
            retry_time_ms = self.config().retry_time_ms,
            "scheduler started"
        );
        true
    }

    /// Stop the loop and cancel the in-flight report wait.
    ///
    /// Returns `false` if the loop was not running. The loop exits on its own
    /// task; use [`Scheduler::shutdown`] to wait for it.
    pub fn stop(&self) -> bool {
        let Some(running) = self.inner.running().take() else {
            return false;
        };
        let was_running = !running.join.is_finished();
        // receivers may already be gone
        let _ = running.shutdown_tx.send(true);
        info!(token = %self.config().token, "scheduler stop requested");
        was_running
    }

    /// Stop the loop and wait until it has exited.
    pub async fn shutdown(&self) -> bool {
        let Some(running) = self.inner.running().take() else {
            return false;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.join.await {
            error!(error = %e, "scheduler loop ended abnormally");
        }
        self.inner.set_state(SchedulerState::Stopped);
        true
    }

    /// Register an upload handler. Every handler receives every batch.
    pub fn on_executed<H>(&self, handler: H) -> Result<(), SchedulerError>
    where
        H: BatchHandler + 'static,
    {
        self.on_executed_arc(Arc::new(handler))
    }

    pub fn on_executed_arc(&self, handler: Arc<dyn BatchHandler>) -> Result<(), SchedulerError> {
        let name = handler.name().to_string();
        self.inner.handlers_mut().register(handler)?;
        debug!(handler = %name, "handler registered");
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.inner.handlers_ref().names()
    }

    /// Queue one payload. A `null` payload is ignored.
    ///
    /// The record is created on first use, due immediately.
    pub fn push(&self, payload: serde_json::Value) -> Result<Option<TaskId>, SchedulerError> {
        if payload.is_null() {
            debug!("ignoring empty payload");
            return Ok(None);
        }
        let mut ids = self.inner.enqueue(vec![payload])?;
        Ok(ids.pop())
    }

    /// Report `payloads` right away, bypassing the queue.
    ///
    /// The same lock, timeout and retry rules as a regular drain apply: when a
    /// drain is already in progress the payloads are queued instead, and when
    /// the report fails they are queued and a retry is planned.
    ///
    /// Dropping the returned future mid-report is treated like a failed
    /// report: the lock is released, the payloads are queued and a retry is
    /// planned.
    pub async fn report(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<ReportStatus, SchedulerError> {
        self.inner.report_now(payloads).await
    }

    /// Run exactly one loop cycle now (waiting for the fire time if needed).
    ///
    /// Dropping the future mid-report releases the lock and plans a retry;
    /// the tasks stay queued.
    pub async fn drain_once(&self) -> Result<DrainOutcome, SchedulerError> {
        let (_keep, mut cancel) = self.inner.cancel_receiver();
        self.inner.cycle(&mut cancel).await
    }

    /// Remove tasks by id. Refused (returns 0) while locked unless `force`.
    pub fn remove(&self, ids: &[TaskId], force: bool) -> Result<usize, SchedulerError> {
        Ok(self.inner.remove(ids, force)?)
    }

    /// Drop every pending task and push the next fire one `interval` out.
    ///
    /// Refused (returns `false`) while locked unless `force`.
    pub fn clear(&self, force: bool) -> Result<bool, SchedulerError> {
        let next_fire_at = self.inner.planner.interval_at();
        let dropped = self.inner.access.update_or_create(|r| {
            if r.locked && !force {
                return None;
            }
            let dropped = r.len();
            r.reset(next_fire_at);
            Some(dropped)
        })?;
        match dropped {
            Some(dropped) => {
                info!(dropped, force, "queue cleared");
                Ok(true)
            }
            None => {
                debug!("clear refused: record is locked");
                Ok(false)
            }
        }
    }

    /// Pending tasks, oldest first.
    pub fn pending(&self) -> Result<Vec<Task>, SchedulerError> {
        Ok(self
            .inner
            .access
            .load()?
            .map(|r| r.tasks)
            .unwrap_or_default())
    }

    /// The whole persisted record, if any.
    pub fn snapshot(&self) -> Result<Option<QueueRecord>, SchedulerError> {
        Ok(self.inner.access.load()?)
    }

    /// Move the next fire time to `now + delay_ms` (`interval` when `None` or
    /// negative). Returns the planned fire time.
    pub fn plan(&self, delay_ms: Option<i64>) -> Result<i64, SchedulerError> {
        Ok(self.inner.planner.plan(delay_ms)?)
    }

    /// Clear a stale lock now. Returns whether one was cleared.
    pub fn kill_dead(&self) -> Result<bool, SchedulerError> {
        Ok(self.inner.locks.kill_dead()?)
    }
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_ref(&self) -> std::sync::RwLockReadGuard<'_, HandlerRegistry> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HandlerRegistry> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Shutdown receiver of the running loop, or a private one that never fires.
    fn cancel_receiver(&self) -> (Option<watch::Sender<bool>>, watch::Receiver<bool>) {
        if let Some(running) = self.running().as_ref() {
            return (None, running.shutdown_tx.subscribe());
        }
        let (tx, rx) = watch::channel(false);
        (Some(tx), rx)
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.access.config().interval();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(SchedulerState::Idle);

            let err = match self.cycle(&mut shutdown).await {
                Ok(outcome) => {
                    debug!(?outcome, "cycle finished");
                    continue;
                }
                Err(SchedulerError::Cancelled) => break,
                Err(err) => err,
            };

            if err.is_soft() {
                debug!(reason = %err, "nothing to drain");
            } else {
                error!(error = %err, "scheduler cycle failed");
            }

            self.set_state(SchedulerState::Waiting);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }
        self.set_state(SchedulerState::Stopped);
        info!("scheduler loop stopped");
    }

    async fn cycle(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DrainOutcome, SchedulerError> {
        self.locks.kill_dead()?;

        let record = self.access.load()?.ok_or(SchedulerError::NotFound)?;
        if record.is_empty() || record.locked {
            return Err(SchedulerError::EmptyOrLocked);
        }
        if self.handlers_ref().is_empty() {
            return Err(SchedulerError::NoHandlers);
        }

        let now = self.access.now();
        if !record.is_due(now) {
            let wait = clamp_wait(
                record.next_fire_at.saturating_sub(now),
                self.access.config().interval_ms,
            );
            debug!(
                next_fire_at = record.next_fire_at,
                wait_ms = wait.as_millis() as u64,
                "waiting for fire time"
            );
            self.set_state(SchedulerState::Waiting);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled(shutdown) => return Err(SchedulerError::Cancelled),
            }
        }

        self.drain(shutdown).await
    }

    async fn drain(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DrainOutcome, SchedulerError> {
        let _gate = self.drain_gate.lock().await;

        let handlers = self.handlers_ref().snapshot();
        if handlers.is_empty() {
            return Err(SchedulerError::NoHandlers);
        }
        // snapshot at fire time: tasks pushed while waiting belong to this batch
        let tasks = self
            .locks
            .acquire_batch()?
            .ok_or(SchedulerError::EmptyOrLocked)?;

        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id().clone()).collect();
        let batch: Batch = tasks.into_iter().map(Task::into_payload).collect();
        let in_flight = InFlight::new(self, Vec::new());
        self.set_state(SchedulerState::Executing);
        info!(batch = ids.len(), "draining queue");

        let result = self.reporter.report(handlers, batch, shutdown).await;
        in_flight.settle();
        self.set_state_if_executing();
        self.settle(result, &ids)
    }

    /// Apply the outcome of a queue drain to the record.
    fn settle(
        &self,
        result: Result<(), SchedulerError>,
        ids: &[TaskId],
    ) -> Result<DrainOutcome, SchedulerError> {
        match result {
            Ok(()) => {
                let next_fire_at = self.planner.interval_at();
                let count = self
                    .access
                    .update_existing(|r| {
                        let removed = r.remove_ids(ids);
                        r.next_fire_at = next_fire_at;
                        r.locked = false;
                        removed
                    })?
                    .unwrap_or(0);
                info!(reported = count, next_fire_at, "batch reported");
                Ok(DrainOutcome::Reported {
                    count,
                    next_fire_at,
                })
            }
            Err(err) => {
                let (_, next_fire_at) = self.release_failed(Vec::new())?;
                warn!(
                    error = %err,
                    pending = ids.len(),
                    next_fire_at,
                    "report failed, retry planned"
                );
                if matches!(err, SchedulerError::Cancelled) {
                    return Err(err);
                }
                Ok(DrainOutcome::Retrying {
                    error: err.to_string(),
                    next_fire_at,
                })
            }
        }
    }

    async fn report_now(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<ReportStatus, SchedulerError> {
        let payloads: Vec<serde_json::Value> =
            payloads.into_iter().filter(|p| !p.is_null()).collect();
        if payloads.is_empty() {
            return Ok(ReportStatus::Skipped);
        }

        let Ok(_gate) = self.drain_gate.try_lock() else {
            let ids = self.enqueue(payloads)?;
            debug!(queued = ids.len(), "drain in progress, payloads queued");
            return Ok(ReportStatus::Queued { ids });
        };

        self.locks.kill_dead()?;
        let handlers = self.handlers_ref().snapshot();
        if handlers.is_empty() || !self.locks.acquire()? {
            let ids = self.enqueue(payloads)?;
            debug!(queued = ids.len(), "cannot report now, payloads queued");
            return Ok(ReportStatus::Queued { ids });
        }
        self.set_state_if_idle(SchedulerState::Executing);

        let count = payloads.len();
        let batch: Batch = payloads.clone().into();
        let in_flight = InFlight::new(self, payloads);
        let (_keep, mut cancel) = self.cancel_receiver();
        let result = self.reporter.report(handlers, batch, &mut cancel).await;
        let payloads = in_flight.settle();
        self.set_state_if_executing();

        match result {
            Ok(()) => {
                self.locks.lock(false)?;
                info!(reported = count, "immediate report done");
                Ok(ReportStatus::Reported { count })
            }
            Err(err) => {
                let (ids, next_fire_at) = self.release_failed(payloads)?;
                warn!(
                    error = %err,
                    queued = ids.len(),
                    next_fire_at,
                    "immediate report failed, payloads queued for retry"
                );
                Ok(ReportStatus::Retrying {
                    ids,
                    error: err.to_string(),
                })
            }
        }
    }

    // The loop owns the Idle/Waiting transitions; an immediate report only
    // marks Executing when the loop is not in the middle of something.
    fn set_state_if_idle(&self, state: SchedulerState) {
        self.state.send_if_modified(|s| {
            if matches!(s, SchedulerState::Idle | SchedulerState::Waiting) {
                *s = state;
                true
            } else {
                false
            }
        });
    }

    fn set_state_if_executing(&self) {
        let running = self.running().as_ref().is_some_and(|r| !r.join.is_finished());
        self.state.send_if_modified(|s| {
            if *s == SchedulerState::Executing {
                *s = if running {
                    SchedulerState::Waiting
                } else {
                    SchedulerState::Stopped
                };
                true
            } else {
                false
            }
        });
    }

    /// Append payloads as new tasks in one write.
    fn enqueue(&self, payloads: Vec<serde_json::Value>) -> Result<Vec<TaskId>, StoreError> {
        let ids = self
            .access
            .update_or_create(|record| self.append_payloads(record, payloads))?;
        debug!(queued = ids.len(), "tasks queued");
        Ok(ids)
    }

    fn append_payloads(
        &self,
        record: &mut QueueRecord,
        payloads: Vec<serde_json::Value>,
    ) -> Vec<TaskId> {
        payloads
            .into_iter()
            .map(|payload| {
                let mut id = self.ids.generate_task_id();
                while record.contains(&id) {
                    id = self.ids.generate_task_id();
                }
                record.append(Task::new(id.clone(), payload));
                id
            })
            .collect()
    }

    /// Unlock after a failed report, queue `requeue` and plan a retry, in one write.
    fn release_failed(
        &self,
        requeue: Vec<serde_json::Value>,
    ) -> Result<(Vec<TaskId>, i64), StoreError> {
        let next_fire_at = self.planner.retry_at();
        let ids = self.access.update_or_create(|r| {
            r.locked = false;
            r.next_fire_at = next_fire_at;
            self.append_payloads(r, requeue)
        })?;
        Ok((ids, next_fire_at))
    }

    fn remove(&self, ids: &[TaskId], force: bool) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.access.try_update(|r| {
            if r.locked && !force {
                debug!("remove refused: record is locked");
                return None;
            }
            let removed = r.remove_ids(ids);
            (removed > 0).then_some(removed)
        })?;
        Ok(removed.unwrap_or(0))
    }
}

/// Lock held by a report that has not settled yet.
///
/// If the owning future is dropped first, the drop releases the lock, queues
/// the bypass payloads it holds and plans a retry, exactly like a failure.
struct InFlight<'a> {
    inner: &'a Inner,
    requeue: Option<Vec<serde_json::Value>>,
}

impl<'a> InFlight<'a> {
    fn new(inner: &'a Inner, requeue: Vec<serde_json::Value>) -> Self {
        Self {
            inner,
            requeue: Some(requeue),
        }
    }

    /// The report settled normally; hand the payloads back to the caller.
    fn settle(mut self) -> Vec<serde_json::Value> {
        self.requeue.take().unwrap_or_default()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(requeue) = self.requeue.take() else {
            return;
        };
        match self.inner.release_failed(requeue) {
            Ok((ids, next_fire_at)) => warn!(
                requeued = ids.len(),
                next_fire_at,
                "report abandoned before it settled, lock released"
            ),
            Err(e) => error!(error = %e, "report abandoned and the lock could not be released"),
        }
        self.inner.set_state_if_executing();
    }
}

/// How long to wait for a fire time `delta_ms` away, capped at one interval.
///
/// A corrupt or far-future `nextFireAt` must not park the loop for longer
/// than `interval`.
fn clamp_wait(delta_ms: i64, interval_ms: u64) -> Duration {
    let delta = u64::try_from(delta_ms).unwrap_or(0);
    Duration::from_millis(delta.min(interval_ms))
}
