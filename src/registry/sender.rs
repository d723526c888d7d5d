use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::registry::session::Session;

/// Outbound half of one live connection.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &Value) -> Result<(), TransportError>;
}

/// Feeds an in-process stream (one SSE response body) through a channel.
/// Sending fails once the stream side has been dropped.
pub struct ChannelSender {
    connection_id: String,
    sender: mpsc::UnboundedSender<Value>,
}

impl ChannelSender {
    pub fn new(connection_id: impl Into<String>, sender: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            connection_id: connection_id.into(),
            sender,
        }
    }
}

#[async_trait]
impl MessageSender for ChannelSender {
    async fn send(&self, message: &Value) -> Result<(), TransportError> {
        self.sender
            .send(message.clone())
            .map_err(|_| TransportError::Closed(self.connection_id.clone()))
    }
}

/// Delivers through a session queue, so whichever consumer drains the session
/// receives the message.
pub struct SessionSender {
    session: Arc<Session>,
}

impl SessionSender {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl MessageSender for SessionSender {
    async fn send(&self, message: &Value) -> Result<(), TransportError> {
        self.session.enqueue(message.clone());
        Ok(())
    }
}
