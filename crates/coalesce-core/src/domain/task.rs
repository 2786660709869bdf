//! Task - キューに積まれる 1 件の仕事
//!
//! 旧形式の `data` キーも payload として読める。

use serde::{Deserialize, Serialize};

use super::TaskId;

/// One queued unit of work: an id plus the producer's opaque payload.
///
/// The scheduler never looks inside `payload`; only the registered handlers do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    #[serde(alias = "data")]
    payload: serde_json::Value,
}

impl Task {
    pub fn new(id: TaskId, payload: serde_json::Value) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}
