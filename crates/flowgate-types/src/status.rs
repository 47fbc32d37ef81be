//! Run lifecycle statuses, validation reports, and control-surface responses.

use serde::{Deserialize, Serialize};

use crate::graph::PipelineId;

// ---------------------------------------------------------------------------
// RunStatus / RunState: lifecycle of one pipeline run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    /// `Completed`, `Failed` and `Aborted` are final; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

/// Snapshot of one run's lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub pipeline_id: PipelineId,
    pub status: RunStatus,
    pub total_segments: usize,
    pub completed_segments: usize,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl RunState {
    pub fn new(pipeline_id: PipelineId, total_segments: usize) -> Self {
        Self {
            pipeline_id,
            status: RunStatus::Starting,
            total_segments,
            completed_segments: 0,
            message: "Pipeline initialized".to_string(),
            created_at: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessStatus: liveness of a run's process group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Failed,
    Stopped,
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// One-line summary of all errors, for error messages and logs.
    pub fn summary(&self) -> String {
        self.errors.join("; ")
    }
}

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Valid,
    Invalid,
    Started,
    Running,
    Failed,
    Stopped,
    Aborted,
    NotFound,
    Rejected,
}

/// Status enumerator plus human-readable message returned by every control operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub pipeline_id: PipelineId,
    pub status: ControlStatus,
    pub message: String,
}

impl ControlResponse {
    pub fn new(pipeline_id: PipelineId, status: ControlStatus, message: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Starting.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }

    #[test]
    fn new_run_state_is_starting() {
        let state = RunState::new(5, 3);
        assert_eq!(state.status, RunStatus::Starting);
        assert_eq!(state.total_segments, 3);
        assert_eq!(state.completed_segments, 0);
        assert_eq!(state.message, "Pipeline initialized");
    }

    #[test]
    fn report_validity_follows_errors_only() {
        let ok = ValidationReport::new(vec![], vec!["schema mismatch".into()]);
        assert!(ok.valid);

        let bad = ValidationReport::new(vec!["a".into(), "b".into()], vec![]);
        assert!(!bad.valid);
        assert_eq!(bad.summary(), "a; b");
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Stopped).unwrap(),
            "\"stopped\""
        );
        assert_eq!(
            serde_json::to_string(&ControlStatus::NotFound).unwrap(),
            "\"not_found\""
        );
    }
}
