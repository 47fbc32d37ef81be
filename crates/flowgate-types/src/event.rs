//! Events emitted by workers and the supervisor, fanned out to observers.
//!
//! Events are transient: they are never persisted and each one is consumed
//! once by the broadcaster.

use serde::{Deserialize, Serialize};

use crate::graph::PipelineId;

/// Well-known `type` values for [`EventCategory::Lifecycle`] events.
pub mod lifecycle {
    pub const SEGMENT_STARTED: &str = "segment_started";
    pub const SEGMENT_COMPLETED: &str = "segment_completed";
    pub const FAILED: &str = "failed";
    pub const COMPLETED: &str = "completed";
    pub const ABORTED: &str = "aborted";
    pub const STOPPED: &str = "stopped";
}

/// Well-known `type` values for [`EventCategory::Stream`] events.
pub mod stream {
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Stream,
    /// Any category this version does not know; ignored on ingestion.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(alias = "pipeline_id")]
    pub run_id: PipelineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_index: Option<usize>,
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn lifecycle(
        run_id: PipelineId,
        segment_index: Option<usize>,
        kind: &str,
        data: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            segment_index,
            category: EventCategory::Lifecycle,
            kind: kind.to_string(),
            topic: None,
            data,
        }
    }

    pub fn stream(
        run_id: PipelineId,
        segment_index: usize,
        kind: &str,
        topic: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            segment_index: Some(segment_index),
            category: EventCategory::Stream,
            kind: kind.to_string(),
            topic: Some(topic.into()),
            data,
        }
    }

    pub fn is_lifecycle(&self, kind: &str) -> bool {
        self.category == EventCategory::Lifecycle && self.kind == kind
    }

    /// Human-readable message carried by the event payload.
    ///
    /// Workers send either a bare string or an object with a `message` field.
    pub fn message(&self) -> String {
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => match map.get("message") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => self.data.to_string(),
            },
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
