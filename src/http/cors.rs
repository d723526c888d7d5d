use std::time::Duration;

use axum::{
    extract::Request,
    http::{header, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};

use crate::http::headers::MCP_SESSION_ID;

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(86400);

/// Any origin may call; the session header is readable by browser clients.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            MCP_SESSION_ID.clone(),
        ])
        .expose_headers([MCP_SESSION_ID.clone()])
        .max_age(PREFLIGHT_MAX_AGE)
}

/// Preflights carry no body, so answer them as 204 rather than 200.
pub async fn preflight_no_content(request: Request, next: Next) -> Response {
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}
