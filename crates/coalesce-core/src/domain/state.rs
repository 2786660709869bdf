//! SchedulerState - スケジューラループの状態

use serde::{Deserialize, Serialize};

/// Where the scheduler loop currently is.
///
/// State transitions:
/// - Stopped -> Idle (start)
/// - Idle -> Waiting -> Idle (fire time in the future, or nothing to do)
/// - Idle -> Executing -> Idle (report succeeded or a retry was planned)
/// - any -> Stopped (stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Not running; no timers pending.
    Stopped,

    /// Deciding what to do next.
    Idle,

    /// Sleeping until the fire time or the next poll.
    Waiting,

    /// A batch is in flight.
    Executing,
}

