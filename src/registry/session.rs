use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A logical conversation with its own unbounded FIFO of pending outbound
/// messages. Any number of producers may enqueue; one consumer drains.
#[derive(Debug)]
pub struct Session {
    id: String,
    sender: mpsc::UnboundedSender<Value>,
    receiver: Mutex<mpsc::UnboundedReceiver<Value>>,
    pending: AtomicUsize,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn enqueue(&self, message: Value) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        // The session owns the receiver, so the channel cannot be closed here.
        if self.sender.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Waits for the next message. Returns `None` once `cancellation` fires.
    pub async fn dequeue(&self, cancellation: &CancellationToken) -> Option<Value> {
        let mut receiver = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return None,
            receiver = self.receiver.lock() => receiver,
        };

        let message = tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            message = receiver.recv() => message,
        };
        if message.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        message
    }

    /// Takes the next message without waiting. Also returns `None` while
    /// another consumer is attached, leaving the message to that consumer.
    pub fn try_dequeue(&self) -> Option<Value> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let message = receiver.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(message)
    }

    /// True while a blocking `dequeue` owns the receiving end.
    pub fn has_consumer(&self) -> bool {
        self.receiver.try_lock().is_err()
    }

    pub fn has_pending_messages(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn dequeues_in_enqueue_order() {
        let session = Session::new("s-1");
        for n in 0..5 {
            session.enqueue(json!(n));
        }

        let cancel = CancellationToken::new();
        for n in 0..5 {
            assert_eq!(session.dequeue(&cancel).await, Some(json!(n)));
        }
        assert!(!session.has_pending_messages());
    }

    #[tokio::test]
    async fn concurrent_producers_keep_per_producer_order() {
        let session = Arc::new(Session::new("s-2"));
        let mut producers = Vec::new();
        for producer in 0..4 {
            let session = Arc::clone(&session);
            producers.push(tokio::spawn(async move {
                for seq in 0..50 {
                    session.enqueue(json!({"producer": producer, "seq": seq}));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer finished");
        }
        assert_eq!(session.pending_count(), 200);

        let mut last_seen = [-1_i64; 4];
        while let Some(message) = session.try_dequeue() {
            let producer = message["producer"].as_u64().expect("producer") as usize;
            let seq = message["seq"].as_i64().expect("seq");
            assert!(seq > last_seen[producer], "out of order for producer {producer}");
            last_seen[producer] = seq;
        }
        assert_eq!(last_seen, [49; 4]);
    }

    #[tokio::test]
    async fn dequeue_waits_for_a_late_producer() {
        let session = Arc::new(Session::new("s-3"));
        let consumer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.dequeue(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.enqueue(json!("late"));

        let message = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke")
            .expect("consumer joined");
        assert_eq!(message, Some(json!("late")));
    }

    #[tokio::test]
    async fn dequeue_stops_on_cancellation() {
        let session = Session::new("s-4");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let message = tokio::time::timeout(Duration::from_secs(1), session.dequeue(&cancel))
            .await
            .expect("dequeue returned");
        assert_eq!(message, None);
    }

    #[tokio::test]
    async fn try_dequeue_leaves_messages_to_an_attached_consumer() {
        let session = Arc::new(Session::new("s-5"));
        let cancel = CancellationToken::new();
        let consumer = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { session.dequeue(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.has_consumer());

        assert_eq!(session.try_dequeue(), None);
        cancel.cancel();
        consumer.await.expect("consumer joined");
        assert!(!session.has_consumer());
    }

    #[test]
    fn has_pending_messages_is_non_blocking() {
        let session = Session::new("s-6");
        assert!(!session.has_pending_messages());
        session.enqueue(json!({"method": "notifications/message"}));
        assert!(session.has_pending_messages());
        assert_eq!(session.try_dequeue(), Some(json!({"method": "notifications/message"})));
        assert!(!session.has_pending_messages());
    }
}
