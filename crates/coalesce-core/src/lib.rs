//! coalesce-core
//!
//! Persistent, batching task scheduler: producers push payloads, and a
//! background loop reports everything queued as one batch per interval,
//! retrying failed reports after a short delay.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, record, state, errors）
//! - **ports**: 抽象化レイヤー（RecordStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStore, JsonFileStore）
//! - **app**: アプリケーションロジック（builder, scheduler, lock, retry, reporter, collector）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    Batch, BatchHandler, BuildError, Collector, ConfigError, DrainOutcome, ReportStatus,
    Scheduler, SchedulerBuilder, SchedulerConfig, handler_fn,
};
pub use domain::{HandlerError, QueueRecord, SchedulerError, SchedulerState, StoreError, Task, TaskId};
pub use impls::{InMemoryStore, JsonFileStore};
pub use ports::{Clock, RecordStore, SystemClock};
