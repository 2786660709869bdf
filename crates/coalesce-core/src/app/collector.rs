//! Collector - formId 用のプロデューサ向けファサード
//!
//! `(formId, params)` を `{ formId, ...params, createTime }` に組み立てて
//! Scheduler に渡す。strict モードでは空・モックの formId を捨てる。

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::app::{ReportStatus, Scheduler};
use crate::domain::{SchedulerError, TaskId};

/// Placeholder id some hosts hand out in development tools.
pub const MOCK_FORM_ID: &str = "the formId is a mock one";

/// Wraps a [`Scheduler`] and turns `(formId, params)` pairs into payloads of
/// the shape `{ "formId": .., <params..>, "createTime": <epoch ms> }`.
/// A `formId` key in `params` wins over the argument; `createTime` is always
/// stamped last.
///
/// In strict mode empty and mock form ids are dropped instead of queued.
#[derive(Clone)]
pub struct Collector {
    scheduler: Scheduler,
    strict: bool,
}

impl Collector {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            strict: true,
        }
    }

    /// Accept every form id, including empty and mock ones.
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Queue a form id for the next batch.
    pub fn push(
        &self,
        form_id: &str,
        params: Map<String, Value>,
    ) -> Result<Option<TaskId>, SchedulerError> {
        match self.payload(form_id, params) {
            Some(payload) => self.scheduler.push(payload),
            None => Ok(None),
        }
    }

    /// Report a form id right away.
    pub async fn report(
        &self,
        form_id: &str,
        params: Map<String, Value>,
    ) -> Result<ReportStatus, SchedulerError> {
        match self.payload(form_id, params) {
            Some(payload) => self.scheduler.report(vec![payload]).await,
            None => Ok(ReportStatus::Skipped),
        }
    }

    fn accepts(&self, form_id: &str) -> bool {
        !self.strict || !(form_id.is_empty() || form_id == MOCK_FORM_ID)
    }

    fn payload(&self, form_id: &str, params: Map<String, Value>) -> Option<Value> {
        if !self.accepts(form_id) {
            debug!(form_id, "dropping form id");
            return None;
        }
        let mut payload = Map::with_capacity(params.len() + 2);
        payload.insert("formId".to_string(), json!(form_id));
        // params may replace formId but never createTime
        payload.extend(params);
        payload.insert("createTime".to_string(), json!(self.scheduler.now_millis()));
        Some(Value::Object(payload))
    }
}
