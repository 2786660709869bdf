//! Reporter - 1 バッチを全ハンドラへ並行に配送し、タイムアウトで打ち切る

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::watch;
use tracing::debug;

use crate::app::handler::{Batch, BatchHandler};
use crate::domain::SchedulerError;

/// Runs all handlers concurrently against the same batch.
///
/// - Every handler runs in its own tokio task, so a panic is contained and
///   shows up as a failure instead of tearing down the loop.
/// - The aggregate succeeds only if every handler succeeds; the first failure
///   fails the whole report.
/// - A `timeout` timer and the cancel signal race the aggregate. When either
///   wins, the reporter stops waiting and the handler tasks are left to
///   finish on their own (best effort, not preemptive).
#[derive(Debug, Clone)]
pub struct Reporter {
    timeout: Duration,
}

impl Reporter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn report(
        &self,
        handlers: Vec<Arc<dyn BatchHandler>>,
        batch: Batch,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        debug!(handlers = handlers.len(), batch = batch.len(), "reporting batch");

        let runs = handlers.into_iter().map(|handler| {
            let batch = Arc::clone(&batch);
            let name = handler.name().to_string();
            let join = tokio::spawn(async move { handler.handle(batch).await });
            async move {
                match join.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(SchedulerError::HandlerFailure(format!("{name}: {e}"))),
                    Err(e) if e.is_panic() => {
                        Err(SchedulerError::HandlerFailure(format!("{name}: panicked")))
                    }
                    Err(e) => Err(SchedulerError::HandlerFailure(format!("{name}: {e}"))),
                }
            }
        });
        let all = try_join_all(runs);

        tokio::select! {
            res = tokio::time::timeout(self.timeout, all) => match res {
                Ok(outcome) => outcome.map(|_| ()),
                Err(_) => Err(SchedulerError::Timeout(self.timeout)),
            },
            _ = cancelled(cancel) => Err(SchedulerError::Cancelled),
        }
    }
}

/// Resolves once the watch value turns `true`. Never resolves if the sender
/// is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
