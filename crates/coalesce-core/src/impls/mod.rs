//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: プロセス内の RecordStore（テスト・組み込み用）
//! - **JsonFileStore**: token ごとの JSON ファイル（再起動をまたいで残る）

pub mod file_store;
pub mod memory_store;

pub use self::file_store::JsonFileStore;
pub use self::memory_store::InMemoryStore;
