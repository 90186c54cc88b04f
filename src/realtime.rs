//! Realtime hub: best-effort JSON fan-out to subscribed clients

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;

/// Subscription map keyed by client id. Delivery is best-effort: a client
/// whose queue is full or whose receiver is gone is dropped on the spot.
pub struct RealtimeHub {
    max_queue: usize,
    subscribers: Mutex<HashMap<String, mpsc::Sender<Value>>>,
}

impl RealtimeHub {
    pub fn new(max_queue: usize) -> Self {
        Self {
            max_queue: max_queue.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a client and hand back its event stream.
    pub async fn subscribe(&self, client_id: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.max_queue);
        self.subscribers
            .lock()
            .await
            .insert(client_id.to_string(), tx);
        debug!(client_id, "Realtime subscriber added");
        rx
    }

    pub async fn unsubscribe(&self, client_id: &str) {
        self.subscribers.lock().await.remove(client_id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Fan a message out to every subscriber. Returns how many clients were
    /// dropped for backpressure or disconnection.
    pub async fn publish(&self, message: Value) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut dropped = Vec::new();

        for (client_id, sender) in subscribers.iter() {
            if sender.try_send(message.clone()).is_err() {
                dropped.push(client_id.clone());
            }
        }

        for client_id in &dropped {
            debug!(client_id = %client_id, "Dropping realtime subscriber");
            subscribers.remove(client_id);
        }
        dropped.len()
    }
}
