//! Legacy Server-Sent Events subscription (`GET /sse`)
//!
//! Each subscriber is a registered connection fed through an unbounded
//! channel. The stream opens with a ping, keeps pinging at the configured
//! interval, and forwards every message sent to the connection. Dropping the
//! response body (client gone, write failure) deregisters the connection.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
};
use chrono::{SecondsFormat, Utc};
use futures_util::{stream, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::mpsc,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{ChannelSender, Registry};
use crate::AppState;

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_PING: &str = "ping";

pub(crate) static X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Removes a connection from the registry when its stream is dropped.
pub(crate) struct ConnectionGuard {
    registry: Registry,
    connection_id: String,
    cancel: CancellationToken,
}

impl ConnectionGuard {
    pub(crate) fn new(registry: Registry, connection_id: String, cancel: CancellationToken) -> Self {
        Self {
            registry,
            connection_id,
            cancel,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.registry.remove_connection(&self.connection_id);
        info!(connection_id = %self.connection_id, "event stream closed");
    }
}

pub(crate) fn message_event<T: Serialize>(message: &T) -> Event {
    match serde_json::to_string(message) {
        Ok(data) => Event::default().event(EVENT_MESSAGE).data(data),
        Err(err) => {
            warn!(error = %err, "failed to serialize event payload");
            Event::default().event(EVENT_MESSAGE).data("null")
        }
    }
}

pub(crate) fn ping_event() -> Event {
    let payload = json!({
        "type": EVENT_PING,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    Event::default().event(EVENT_PING).data(payload.to_string())
}

struct Subscription {
    receiver: mpsc::UnboundedReceiver<Value>,
    ticker: Interval,
    cancel: CancellationToken,
    _guard: ConnectionGuard,
}

pub fn subscription_stream(
    registry: Registry,
    ping_interval: Duration,
    shutdown: &CancellationToken,
) -> (String, impl Stream<Item = Result<Event, Infallible>>) {
    let connection_id = Uuid::new_v4().to_string();
    let (sender, receiver) = mpsc::unbounded_channel();
    registry.add_connection(
        connection_id.clone(),
        Arc::new(ChannelSender::new(connection_id.clone(), sender)),
    );
    info!(connection_id = %connection_id, "sse subscriber connected");

    // The first tick completes immediately and produces the opening ping.
    let mut ticker = interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cancel = shutdown.child_token();

    let state = Subscription {
        receiver,
        ticker,
        cancel: cancel.clone(),
        _guard: ConnectionGuard::new(registry, connection_id.clone(), cancel),
    };

    let events = stream::unfold(state, |mut state| async move {
        let event = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => {
                debug!("sse subscription cancelled");
                return None;
            }
            _ = state.ticker.tick() => ping_event(),
            message = state.receiver.recv() => match message {
                Some(message) => message_event(&message),
                None => return None,
            },
        };
        Some((Ok(event), state))
    });

    (connection_id, events)
}

pub async fn sse_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    let (_connection_id, events) = subscription_stream(
        state.registry.clone(),
        state.config.sse_ping_interval,
        &state.shutdown,
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING.clone(), "no"),
        ],
        Sse::new(events),
    )
}
