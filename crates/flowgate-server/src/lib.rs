//! HTTP surface of the flowgate supervisor.
//!
//! - `/pipelines/:id/{validate,start,stop,abort,status}`: control operations
//! - `POST /stream/event`: worker event ingestion
//! - `GET /ws/stream`: observer WebSocket, one JSON text frame per event

pub mod control;
pub mod error;
pub mod stream;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use flowgate_supervisor::Supervisor;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pipelines/:id/validate", post(control::validate))
        .route("/pipelines/:id/start", post(control::start))
        .route("/pipelines/:id/stop", post(control::stop))
        .route("/pipelines/:id/abort", post(control::abort))
        .route("/pipelines/:id/status", get(control::status))
        .route("/stream/event", post(stream::ingest_event))
        .route("/ws/stream", get(stream::ws_stream))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then tear down every active run.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let supervisor = state.supervisor.clone();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("listening on http://{}", addr);
    }
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    supervisor.shutdown_all().await;
    result
}
