//! Errors - エラー型と分類
//!
//! ループ内部で起きる失敗（NotFound / EmptyOrLocked / NoHandlers /
//! HandlerFailure / Timeout / Cancelled）はすべてループ内で再スケジュールに変換され、
//! producer には届かない。producer 側の呼び出しが返すのは
//! `InvalidHandler` と `Store` だけ。

use std::time::Duration;

use thiserror::Error;

/// Failure of the persisted key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store record is not valid json: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Scheduler error taxonomy.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No queue record exists yet.
    #[error("schedule is not found")]
    NotFound,

    /// The record has no tasks, or another drain holds the lock.
    #[error("schedule is empty or locked")]
    EmptyOrLocked,

    /// Nothing has been registered through `on_executed` yet.
    #[error("no handler registered")]
    NoHandlers,

    /// A handler returned an error or panicked.
    #[error("handler failed: {0}")]
    HandlerFailure(String),

    /// The aggregate report did not finish in time.
    #[error("report timed out after {0:?}")]
    Timeout(Duration),

    /// `stop()` interrupted the report.
    #[error("report has been cancelled")]
    Cancelled,

    /// Registration contract violation.
    #[error("invalid handler: {0}")]
    InvalidHandler(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Soft failures only mean "nothing to do this cycle".
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SchedulerError::NotFound | SchedulerError::EmptyOrLocked | SchedulerError::NoHandlers
        )
    }
}

/// Failure reported by an upload handler for its own side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
