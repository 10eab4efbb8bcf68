//! HTTP handlers: health check and JSON-RPC dispatch through the mesh router.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use meshkv_core::error::codes;
use meshkv_core::mesh::protocol::{MeshRequest, MeshResponse, JSONRPC_VERSION};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node": state.router.local_address(),
    }))
}

/// JSON-RPC over HTTP. The request is routed exactly like one arriving from a
/// peer, so it may execute here or on the node named by `params.dest`.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MeshRequest>,
) -> impl IntoResponse {
    let id = request.id.clone();
    if request.jsonrpc != JSONRPC_VERSION {
        return (
            StatusCode::OK,
            Json(MeshResponse::error(
                id,
                codes::INVALID_REQUEST,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            )),
        );
    }

    let method = &request.method;
    let params = request
        .params
        .unwrap_or_else(|| Value::Object(Default::default()));
    debug!("RPC call: {}({})", method, params);

    match state.router.dispatch(method, params).await {
        Ok(result) => (StatusCode::OK, Json(MeshResponse::success(id, result))),
        Err(e) => {
            warn!("RPC error for {}: {}", method, e);
            (StatusCode::OK, Json(MeshResponse::from_error(id, &e)))
        }
    }
}
