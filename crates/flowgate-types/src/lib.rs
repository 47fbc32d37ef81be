//! Shared types, errors, events, and statuses for the flowgate pipeline supervisor.
//!
//! This crate provides the foundational types used across all other flowgate crates:
//! - `FlowgateError`: unified error taxonomy
//! - `PipelineGraph` / `NodeRef`: the stored graph of inputs, transformations and outputs
//! - `Event`: lifecycle and stream events flowing from workers to observers
//! - `RunStatus` / `RunState`: the lifecycle state machine of one pipeline run

pub mod duration_serde;
pub mod event;
pub mod graph;
pub mod status;

pub use event::{Event, EventCategory};
pub use graph::{
    Flow, InputNode, NodeKind, NodeRef, OutputNode, PipelineGraph, PipelineId, Schema,
    TransformationNode,
};
pub use status::{
    ControlResponse, ControlStatus, ProcessStatus, RunState, RunStatus, ValidationReport,
};

/// Unified error type for all flowgate subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlowgateError {
    // === Pre-execution Errors ===
    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    #[error("Execution plan could not be built: {0}")]
    Compile(String),

    #[error("Transformation could not be loaded: {0}")]
    Load(String),

    // === Execution Errors ===
    #[error("Transformation raised: {0}")]
    Script(String),

    #[error("Runtime fault in segment {segment}: {message}")]
    RuntimeFault { segment: usize, message: String },

    #[error("Broker at {address} unavailable: {message}")]
    Transport { address: String, message: String },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    // === Control Errors ===
    #[error("Pipeline {0} not found")]
    PipelineNotFound(PipelineId),

    #[error("Pipeline {0} is already running")]
    AlreadyRunning(PipelineId),

    #[error("Graph store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowgateError {
    /// Returns `true` if the error blocks execution before any worker is spawned.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowgateError::Validation(_)
                | FlowgateError::Compile(_)
                | FlowgateError::PipelineNotFound(_)
        )
    }

    /// Maps the error to an HTTP status code for the control surface.
    pub fn http_status(&self) -> u16 {
        match self {
            FlowgateError::Validation(_) | FlowgateError::Compile(_) => 400,
            FlowgateError::PipelineNotFound(_) => 404,
            FlowgateError::AlreadyRunning(_) => 409,
            FlowgateError::Transport { .. } => 502,
            _ => 500,
        }
    }
}

/// A convenience alias for `Result<T, FlowgateError>`.
pub type Result<T> = std::result::Result<T, FlowgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_validation() {
        let err = FlowgateError::Validation("cycle detected".into());
        assert_eq!(err.to_string(), "Pipeline validation failed: cycle detected");
    }

    #[test]
    fn error_display_runtime_fault() {
        let err = FlowgateError::RuntimeFault {
            segment: 2,
            message: "transformation_4 raised".into(),
        };
        assert_eq!(
            err.to_string(),
            "Runtime fault in segment 2: transformation_4 raised"
        );
    }

    #[test]
    fn error_display_transport() {
        let err = FlowgateError::Transport {
            address: "b1:9092".into(),
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Broker at b1:9092 unavailable: connection refused"
        );
    }

    #[test]
    fn error_display_already_running() {
        let err = FlowgateError::AlreadyRunning(7);
        assert_eq!(err.to_string(), "Pipeline 7 is already running");
    }

    #[test]
    fn terminal_errors() {
        assert!(FlowgateError::Validation("x".into()).is_terminal());
        assert!(FlowgateError::Compile("x".into()).is_terminal());
        assert!(FlowgateError::PipelineNotFound(1).is_terminal());
        assert!(!FlowgateError::AlreadyRunning(1).is_terminal());
        assert!(!FlowgateError::Script("boom".into()).is_terminal());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(FlowgateError::Validation("x".into()).http_status(), 400);
        assert_eq!(FlowgateError::Compile("x".into()).http_status(), 400);
        assert_eq!(FlowgateError::PipelineNotFound(3).http_status(), 404);
        assert_eq!(FlowgateError::AlreadyRunning(3).http_status(), 409);
        assert_eq!(
            FlowgateError::Transport {
                address: "a".into(),
                message: "b".into()
            }
            .http_status(),
            502
        );
        assert_eq!(FlowgateError::Other("x".into()).http_status(), 500);
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FlowgateError = io_err.into();
        assert!(matches!(err, FlowgateError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: FlowgateError = json_err.into();
        assert!(matches!(err, FlowgateError::Json(_)));
    }
}
