//! BatchHandler - バッチを受け取るアップロードハンドラと、その登録簿

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{HandlerError, SchedulerError};

/// The payloads of one drain, oldest first. Shared by every handler.
pub type Batch = Arc<[serde_json::Value]>;

/// A handler that uploads one batch of task payloads.
///
/// Each handler decides success or failure for its own side effect (a
/// network call, a file append, ...). The scheduler treats the batch as
/// reported only when every registered handler returns `Ok`.
///
/// Cancellation is cooperative: when the report times out or the scheduler
/// stops, the scheduler stops waiting, but a handler that is already running
/// is not interrupted and its side effects may still happen.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Unique, non-empty name used for registration and logs.
    fn name(&self) -> &str;

    async fn handle(&self, batch: Batch) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`BatchHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Build a handler from a name and an async closure.
///
/// ```ignore
/// scheduler.on_executed(handler_fn("upload", |batch| async move {
///     client.post(&*batch).await.map_err(|e| HandlerError::new(e.to_string()))
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> BatchHandler for FnHandler<F>
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, batch: Batch) -> Result<(), HandlerError> {
        (self.f)(batch).await
    }
}

/// Registered handlers, in registration order.
///
/// Registration rejects an empty name or a name that is already taken; both
/// are programming errors and are reported as `InvalidHandler`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn BatchHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn BatchHandler>) -> Result<(), SchedulerError> {
        let name = handler.name();
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidHandler(
                "handler name must not be empty".to_string(),
            ));
        }
        if self.handlers.iter().any(|h| h.name() == name) {
            return Err(SchedulerError::InvalidHandler(format!(
                "handler '{name}' is already registered"
            )));
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Cheap snapshot of the current handlers for one report.
    pub fn snapshot(&self) -> Vec<Arc<dyn BatchHandler>> {
        self.handlers.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
