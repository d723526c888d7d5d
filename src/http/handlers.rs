//! Axum HTTP handlers for the web server
//!
//! Health and discovery metadata, plus the legacy one-shot RPC endpoint for
//! clients that predate the streamable transport.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::mcp::rpc::JsonRpcResponse;
use crate::mcp::server::SUPPORTED_PROTOCOL_VERSION;
use crate::AppState;

pub const LEGACY_SSE_PATH: &str = "/sse";
pub const LEGACY_RPC_PATH: &str = "/rpc";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct LegacyEndpoints {
    pub sse: &'static str,
    pub rpc: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub protocol_version: &'static str,
    pub mcp_endpoint: String,
    pub legacy: LegacyEndpoints,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: SUPPORTED_PROTOCOL_VERSION,
        mcp_endpoint: state.config.mcp_path.clone(),
        legacy: LegacyEndpoints {
            sse: LEGACY_SSE_PATH,
            rpc: LEGACY_RPC_PATH,
        },
    })
}

pub async fn rpc_endpoint(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "unparseable rpc body");
            return Json(JsonRpcResponse::parse_error(err.to_string())).into_response();
        }
    };

    // One-shot requests have no stream to correlate later notifications with.
    let scope = format!("rpc:{}", Uuid::new_v4());
    let cancellation = state.shutdown.child_token();
    let abort_guard = cancellation.clone().drop_guard();
    let response = state
        .dispatcher
        .handle_value(payload, &scope, &cancellation)
        .await;
    abort_guard.disarm();

    match response {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
