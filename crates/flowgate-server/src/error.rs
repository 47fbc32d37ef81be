use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use flowgate_types::{ControlResponse, ControlStatus, FlowgateError, PipelineId};

/// A control operation that failed, rendered as `{pipeline_id, status, message}`.
#[derive(Debug)]
pub struct ApiError {
    pub pipeline_id: PipelineId,
    pub error: FlowgateError,
}

impl ApiError {
    pub fn new(pipeline_id: PipelineId, error: FlowgateError) -> Self {
        Self { pipeline_id, error }
    }

    fn control_status(&self) -> ControlStatus {
        match self.error {
            FlowgateError::Validation(_) | FlowgateError::Compile(_) => ControlStatus::Invalid,
            FlowgateError::PipelineNotFound(_) => ControlStatus::NotFound,
            FlowgateError::AlreadyRunning(_) => ControlStatus::Rejected,
            _ => ControlStatus::Failed,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if code.is_server_error() {
            tracing::error!(pipeline_id = self.pipeline_id, error = %self.error, "Control operation failed");
        }
        let body = ControlResponse::new(self.pipeline_id, self.control_status(), self.error.to_string());
        (code, Json(body)).into_response()
    }
}
