use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod registry;
pub mod stdio;

use config::Config;
use domain::registry::ToolRegistry;
use http::handlers::{LEGACY_RPC_PATH, LEGACY_SSE_PATH};
use mcp::server::Dispatcher;
use registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Registry,
    pub config: Arc<Config>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, tools: Arc<dyn ToolRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(tools)),
            registry: Registry::new(),
            config: Arc::new(config),
            shutdown,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let mcp_path = state.config.mcp_path.clone();

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(
            &mcp_path,
            get(http::streamable::get_endpoint)
                .post(http::streamable::post_endpoint),
        )
        .route(LEGACY_SSE_PATH, get(http::sse::sse_endpoint))
        .route(LEGACY_RPC_PATH, post(http::handlers::rpc_endpoint))
        .layer(http::cors::cors_layer())
        .layer(middleware::from_fn(http::cors::preflight_no_content))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
