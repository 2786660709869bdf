//! Domain - ドメインモデル
//!
//! TaskId / Task / Queue Record / ループ状態 / エラー型。
//! I/O を持たない純粋な型だけを置く。

pub mod errors;
pub mod ids;
pub mod record;
pub mod state;
pub mod task;

pub use self::errors::{HandlerError, SchedulerError, StoreError};
pub use self::ids::TaskId;
pub use self::record::QueueRecord;
pub use self::state::SchedulerState;
pub use self::task::Task;
