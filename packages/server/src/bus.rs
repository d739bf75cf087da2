//! Pub/sub event bus: a durable journal, typed in-process subscribers, and
//! bounded SSE fanout queues for facades that watch the bus over HTTP.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::models::BusEvent;
use crate::store::Store;

const SSE_QUEUE_CAPACITY: usize = 256;

pub type SseEvent = Value;

/// Implemented by in-process observers registered against a topic (or `*`).
pub trait Subscriber: Send + Sync {
    fn notify(&self, topic: &str, data: &Value);
}

struct Registry {
    by_topic: std::collections::HashMap<String, Vec<Arc<dyn Subscriber>>>,
    wildcard: Vec<Arc<dyn Subscriber>>,
    sse_queues: Vec<mpsc::Sender<SseEvent>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            by_topic: std::collections::HashMap::new(),
            wildcard: Vec::new(),
            sse_queues: Vec::new(),
        }
    }
}

/// Cloneable handle to the process-wide bus. Publishing is best-effort for
/// observers but durable via the journal: a journal write failure is logged
/// and does not block dispatch, and a failing subscriber is logged and does
/// not poison the rest of the fanout.
#[derive(Clone)]
pub struct Bus {
    store: Store,
    registry: Arc<RwLock<Registry>>,
}

impl Bus {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub async fn subscribe(&self, topic: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        let topic = topic.into();
        let mut registry = self.registry.write().await;
        if topic == "*" {
            registry.wildcard.push(subscriber);
        } else {
            registry.by_topic.entry(topic).or_default().push(subscriber);
        }
    }

    /// Removes a previously registered subscriber from `topic` (or the
    /// wildcard list), compared by pointer identity rather than value.
    pub async fn unsubscribe(&self, topic: &str, subscriber: &Arc<dyn Subscriber>) {
        let mut registry = self.registry.write().await;
        if topic == "*" {
            registry.wildcard.retain(|sub| !Arc::ptr_eq(sub, subscriber));
        } else if let Some(subs) = registry.by_topic.get_mut(topic) {
            subs.retain(|sub| !Arc::ptr_eq(sub, subscriber));
        }
    }

    /// Persist to the journal, then dispatch to topic-specific and wildcard
    /// subscribers, then push (non-blocking) to every live SSE queue.
    pub async fn publish(&self, event_type: &str, data: Value, source: Option<&str>) {
        let row = BusEvent {
            event_type: event_type.to_string(),
            source: source.map(str::to_string),
            data: data.clone(),
            created_at: Utc::now(),
        };

        if let Err(err) = self.journal(&row).await {
            warn!(event_type, error = %err, "bus journal write failed, continuing dispatch");
        }

        let registry = self.registry.read().await;
        if let Some(subs) = registry.by_topic.get(event_type) {
            for sub in subs {
                sub.notify(event_type, &data);
            }
        }
        for sub in &registry.wildcard {
            sub.notify(event_type, &data);
        }

        drop(registry);
        self.dispatch_sse(event_type, &data).await;
    }

    async fn journal(&self, row: &BusEvent) -> crate::error::Result<()> {
        sqlx::query(
            "INSERT INTO bus_events (event_type, source, data, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&row.event_type)
        .bind(&row.source)
        .bind(row.data.to_string())
        .bind(row.created_at.to_rfc3339())
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }

    /// Allocates a new bounded SSE queue and returns its receiving end.
    pub async fn create_sse_queue(&self) -> mpsc::Receiver<SseEvent> {
        let (tx, rx) = mpsc::channel(SSE_QUEUE_CAPACITY);
        self.registry.write().await.sse_queues.push(tx);
        rx
    }

    /// Drops every sender that's already closed. Called opportunistically;
    /// callers that hold a `Receiver` and drop it are the usual trigger.
    pub async fn remove_sse_queue(&self) {
        self.registry
            .write()
            .await
            .sse_queues
            .retain(|tx| !tx.is_closed());
    }

    async fn dispatch_sse(&self, event_type: &str, data: &Value) {
        let payload = serde_json::json!({ "type": event_type, "data": data });
        let mut registry = self.registry.write().await;
        registry.sse_queues.retain(|tx| {
            if tx.is_closed() {
                return false;
            }
            match tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event_type, "sse queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}
