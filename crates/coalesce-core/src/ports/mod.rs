//! Ports - 抽象化レイヤー
//!
//! スケジューラが外部に依存する境界をここに集める。
//! 実装は `impls` に置き、テストでは差し替える。

pub mod clock;
pub mod id_generator;
pub mod record_store;

pub use self::clock::{Clock, FixedClock, SystemClock, TokioClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::record_store::RecordStore;
