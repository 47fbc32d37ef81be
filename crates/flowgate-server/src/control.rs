//! Control operation handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use flowgate_supervisor::{StartOptions, StatusReport};
use flowgate_types::{ControlResponse, ControlStatus, FlowgateError, PipelineId};

use crate::{ApiError, AppState};

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn validate(
    State(state): State<AppState>,
    Path(id): Path<PipelineId>,
) -> ApiResult<Value> {
    let report = state
        .supervisor
        .validate(id)
        .await
        .map_err(|e| ApiError::new(id, e))?;
    let (status, message) = if report.valid {
        (ControlStatus::Valid, "Pipeline is valid".to_string())
    } else {
        (ControlStatus::Invalid, report.summary())
    };
    Ok(Json(json!({
        "pipeline_id": id,
        "status": status,
        "message": message,
        "report": report,
    })))
}

/// The body is optional; an empty body means default [`StartOptions`].
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<PipelineId>,
    body: Bytes,
) -> ApiResult<Value> {
    let options = if body.iter().all(u8::is_ascii_whitespace) {
        StartOptions::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(id, FlowgateError::Validation(format!("invalid start options: {e}")))
        })?
    };
    let report = state
        .supervisor
        .start(id, options)
        .await
        .map_err(|e| ApiError::new(id, e))?;
    Ok(Json(serde_json::to_value(report).map_err(|e| ApiError::new(id, e.into()))?))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<PipelineId>,
) -> Json<ControlResponse> {
    Json(state.supervisor.stop(id).await)
}

pub async fn abort(
    State(state): State<AppState>,
    Path(id): Path<PipelineId>,
) -> Json<ControlResponse> {
    Json(state.supervisor.abort(id).await)
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<PipelineId>,
) -> Json<StatusReport> {
    Json(state.supervisor.get_status(id).await)
}
