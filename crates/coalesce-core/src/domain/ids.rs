//! Ids - TaskId
//!
//! TaskId は Queue Record の中だけで一意であればよい（グローバル一意は要求しない）。
//! 既定の生成器は ULID 文字列を使うが、永続化済みのレコードに入っている
//! 任意の文字列 id もそのまま読み込めるように、中身は `String` で保持する。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a queued task, unique within one Queue Record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_serializes_as_plain_string() {
        let id = TaskId::new("a1b2c3");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"a1b2c3\"");

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn from_ulid_uses_canonical_text() {
        let ulid = Ulid::new();
        let id: TaskId = ulid.into();
        assert_eq!(id.as_str(), ulid.to_string());
        assert_eq!(id.as_str().len(), 26);
    }
}
