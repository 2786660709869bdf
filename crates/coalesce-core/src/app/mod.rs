//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューリングのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 構築とワイヤリング（Fail-fast 検証）
//! - **Scheduler**: 待機→ロック→報告→計画のループ
//! - **LockManager**: アドバイザリロックと stale lock の回収
//! - **RetryPlanner**: 次回発火時刻の計画
//! - **Reporter**: ハンドラへの並行配送とタイムアウト
//! - **Collector**: formId 用のプロデューサ向けファサード

pub mod access;
pub mod builder;
pub mod collector;
pub mod config;
pub mod handler;
pub mod lock;
pub mod reporter;
pub mod retry;
pub mod scheduler;

// 主要な型を再エクスポート
pub use self::access::RecordAccess;
pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::collector::{Collector, MOCK_FORM_ID};
pub use self::config::{ConfigError, DEFAULT_TOKEN, SchedulerConfig};
pub use self::handler::{Batch, BatchHandler, FnHandler, HandlerRegistry, handler_fn};
pub use self::lock::LockManager;
pub use self::reporter::Reporter;
pub use self::retry::RetryPlanner;
pub use self::scheduler::{DrainOutcome, ReportStatus, Scheduler};
