//! Streamable HTTP transport on the configured MCP path
//!
//! `GET` subscribes to a session queue as an event stream, `POST` carries one
//! JSON-RPC message and answers either as JSON or as a short event stream,
//! `OPTIONS` is the CORS preflight. Every response echoes `Mcp-Session-Id`.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::{typed_header::TypedHeaderRejection, TypedHeader};
use futures_util::{stream, Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::http::headers::{resolve_session_id, McpSessionId};
use crate::http::sse::{message_event, ConnectionGuard, X_ACCEL_BUFFERING};
use crate::mcp::rpc::{JsonRpcMessage, JsonRpcResponse};
use crate::mcp::server::is_streaming_method;
use crate::registry::{Registry, Session, SessionSender};
use crate::AppState;

const EVENT_STREAM: &str = "text/event-stream";

/// True when any Accept entry names `text/event-stream`, ignoring parameters.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|item| item.split(';').next())
        .any(|media| media.trim().eq_ignore_ascii_case(EVENT_STREAM))
}

struct Subscriber {
    session: Arc<Session>,
    cancel: CancellationToken,
    _guard: ConnectionGuard,
}

/// Registers a subscriber connection for `session` and streams its queue.
pub fn session_stream(
    registry: Registry,
    session: Arc<Session>,
    shutdown: &CancellationToken,
) -> (String, impl Stream<Item = Result<Event, Infallible>>) {
    let connection_id = Uuid::new_v4().to_string();
    registry.add_connection(
        connection_id.clone(),
        Arc::new(SessionSender::new(Arc::clone(&session))),
    );
    info!(
        connection_id = %connection_id,
        session_id = %session.id(),
        "session subscriber connected"
    );

    let cancel = shutdown.child_token();
    let state = Subscriber {
        session,
        cancel: cancel.clone(),
        _guard: ConnectionGuard::new(registry, connection_id.clone(), cancel),
    };

    let events = stream::unfold(state, |state| async move {
        let message = state.session.dequeue(&state.cancel).await?;
        Some((Ok(message_event(&message)), state))
    });

    (connection_id, events)
}

pub async fn get_endpoint(
    State(state): State<AppState>,
    session_header: Result<TypedHeader<McpSessionId>, TypedHeaderRejection>,
) -> Result<Response, AppError> {
    let session_id = resolve_session_id(session_header)?;
    let session = state.registry.get_or_create_session(&session_id);
    let (_connection_id, events) =
        session_stream(state.registry.clone(), session, &state.shutdown);

    Ok((
        TypedHeader(McpSessionId(session_id)),
        [(X_ACCEL_BUFFERING.clone(), "no")],
        Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.sse_ping_interval)),
    )
        .into_response())
}

/// Messages already queued for the session, taken without waiting. Yields
/// nothing while a `GET` subscriber owns the queue.
fn drain_pending(session: Arc<Session>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(session, |session| async move {
        let message = session.try_dequeue()?;
        Some((Ok(message_event(&message)), session))
    })
}

pub async fn post_endpoint(
    State(state): State<AppState>,
    session_header: Result<TypedHeader<McpSessionId>, TypedHeaderRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let session_id = resolve_session_id(session_header)?;
    let session = state.registry.get_or_create_session(&session_id);
    let session_header = TypedHeader(McpSessionId(session_id));

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "unparseable request body");
            return Ok((
                session_header,
                Json(JsonRpcResponse::parse_error(err.to_string())),
            )
                .into_response());
        }
    };

    let request = match JsonRpcMessage::from_value(payload) {
        Ok(JsonRpcMessage::Request(request)) => request,
        Ok(JsonRpcMessage::Notification(notification)) => {
            state.dispatcher.notify(notification, session.id());
            return Ok((StatusCode::ACCEPTED, session_header).into_response());
        }
        Ok(JsonRpcMessage::ClientResponse(_)) => {
            debug!(session_id = %session.id(), "ignoring client response");
            return Ok((StatusCode::ACCEPTED, session_header).into_response());
        }
        Err((id, error)) => {
            return Ok((session_header, Json(JsonRpcResponse::failure(id, error))).into_response());
        }
    };

    let method = request.method.clone();
    // Fires if the client aborts the request while the handler is suspended.
    let cancellation = state.shutdown.child_token();
    let abort_guard = cancellation.clone().drop_guard();
    let response = state
        .dispatcher
        .dispatch(request, session.id(), &cancellation)
        .await;
    abort_guard.disarm();

    if accepts_event_stream(&headers) && is_streaming_method(&method) {
        debug!(
            session_id = %session.id(),
            method = %method,
            subscriber_attached = session.has_consumer(),
            "answering as event stream"
        );
        let first = stream::once(async move { Ok::<_, Infallible>(message_event(&response)) });
        let events = first.chain(drain_pending(session));
        return Ok((
            session_header,
            [(X_ACCEL_BUFFERING.clone(), "no")],
            Sse::new(events),
        )
            .into_response());
    }

    Ok((session_header, Json(response)).into_response())
}
