use crate::document::{CustomEvent, HostDocument};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub const TASK_COMPLETED: &str = "task-completed";
pub const TASK_CLOSED: &str = "task-closed";

/// Payload of both outcome events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeDetail<'a> {
    pub ad_id: &'a str,
    pub task_id: Option<&'a str>,
}

/// The only channel the host is expected to watch for slot outcomes.
#[derive(Clone)]
pub struct EventBridge {
    document: HostDocument,
}

impl EventBridge {
    pub fn new(document: HostDocument) -> Self {
        Self { document }
    }

    pub fn emit_completed(&self, ad_id: &str, task_id: &str) {
        self.emit(TASK_COMPLETED, ad_id, Some(task_id));
    }

    /// `task_id` is `None` when the slot is closed before a task arrived.
    pub fn emit_closed(&self, ad_id: &str, task_id: Option<&str>) {
        self.emit(TASK_CLOSED, ad_id, task_id);
    }

    fn emit(&self, name: &str, ad_id: &str, task_id: Option<&str>) {
        let detail = OutcomeDetail { ad_id, task_id };
        debug!(event = name, ad_id, task_id, "dispatching outcome event");
        self.document.dispatch_event(CustomEvent {
            name: name.to_string(),
            detail: serde_json::to_value(&detail).unwrap_or(Value::Null),
        });
    }
}
