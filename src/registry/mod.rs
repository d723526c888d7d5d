//! Connection and session bookkeeping shared by every transport
//!
//! Connections are live transport streams keyed by connection id; sessions are
//! logical conversations keyed by session id, each owning a FIFO queue. The two
//! id spaces are independent and a session may outlive the connection that
//! created it.

pub mod sender;
pub mod session;

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::mcp::rpc::JsonRpcNotification;

pub use sender::{ChannelSender, MessageSender, SessionSender};
pub use session::Session;

#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<DashMap<String, Arc<dyn MessageSender>>>,
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (and keeps the existing sender) if the id is taken.
    pub fn add_connection(&self, id: impl Into<String>, sender: Arc<dyn MessageSender>) -> bool {
        let id = id.into();
        match self.connections.entry(id) {
            Entry::Occupied(entry) => {
                warn!(connection_id = %entry.key(), "connection already registered");
                false
            }
            Entry::Vacant(entry) => {
                debug!(connection_id = %entry.key(), "connection registered");
                entry.insert(sender);
                true
            }
        }
    }

    pub fn remove_connection(&self, id: &str) -> bool {
        if self.connections.remove(id).is_some() {
            debug!(connection_id = %id, "connection removed");
            true
        } else {
            debug!(connection_id = %id, "connection already removed");
            false
        }
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<dyn MessageSender>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends to every connection concurrently. Connections whose send fails
    /// are removed; the others are unaffected. Returns the delivered count.
    pub async fn broadcast(&self, notification: &JsonRpcNotification) -> usize {
        let message = match serde_json::to_value(notification) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, method = %notification.method, "broadcast serialization failed");
                return 0;
            }
        };

        let targets = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect::<Vec<_>>();

        let outcomes = join_all(targets.into_iter().map(|(id, sender)| {
            let message = &message;
            async move {
                let outcome = sender.send(message).await;
                (id, sender, outcome)
            }
        }))
        .await;

        let mut delivered = 0;
        for (id, sender, outcome) in outcomes {
            match outcome {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "broadcast send failed, dropping connection");
                    // Only drop the sender that failed, not a reconnect under the same id.
                    self.connections
                        .remove_if(&id, |_, current| Arc::ptr_eq(current, &sender));
                }
            }
        }

        debug!(method = %notification.method, delivered, "broadcast complete");
        delivered
    }

    /// Creates a fresh queue for `session_id`, replacing any existing one.
    pub fn create_session(&self, session_id: impl Into<String>) -> Arc<Session> {
        let session_id = session_id.into();
        let session = Arc::new(Session::new(session_id.clone()));
        if self
            .sessions
            .insert(session_id.clone(), Arc::clone(&session))
            .is_some()
        {
            info!(session_id = %session_id, "session replaced");
        } else {
            debug!(session_id = %session_id, "session created");
        }
        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_or_create_session(&self, session_id: &str) -> Arc<Session> {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "session created");
                Arc::new(Session::new(session_id))
            });
        Arc::clone(entry.value())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
