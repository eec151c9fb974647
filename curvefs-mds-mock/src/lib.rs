//! Mock MDS topology service.
//!
//! Serves a [`MemoryMds`] at `POST /TopologyService/{method}`, the same URL
//! layout brpc uses for HTTP/JSON access to protobuf services.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::debug;

use curvefs_topo::mds::wire::{MutationRequest, LIST_TOPOLOGY, SERVICE_NAME};
use curvefs_topo::MemoryMds;

/// Mutation methods served next to `ListTopology`.
pub const MUTATION_METHODS: &[&str] = &[
    "CreatePool",
    "CreateZone",
    "CreateServer",
    "UpdateServer",
    "DeleteServer",
    "DeleteZone",
    "DeletePool",
];

/// Error body for requests that never reach the model.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub fn create_router(mds: Arc<MemoryMds>) -> Router {
    Router::new()
        .route(&format!("/{}/{{method}}", SERVICE_NAME), post(call_method))
        .layer(TraceLayer::new_for_http())
        .with_state(mds)
}

async fn call_method(
    State(mds): State<Arc<MemoryMds>>,
    Path(method): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    if method == LIST_TOPOLOGY {
        return Ok(Json(mds.handle_list()).into_response());
    }
    if !MUTATION_METHODS.contains(&method.as_str()) {
        return Err(ApiError {
            error: format!("unknown method {}.{}", SERVICE_NAME, method),
            code: 404,
        });
    }

    let request = MutationRequest::decode(&method, body).map_err(|e| ApiError {
        error: format!("invalid {} request: {}", method, e),
        code: 400,
    })?;
    debug!(method = %method, request_id = request.request_id(), "Received mutation");
    Ok(Json(mds.handle(&request)).into_response())
}
