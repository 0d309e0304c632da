//! Fan-out of live trace and token-level events to stream subscribers.
//!
//! Publishing never blocks. Every subscriber reads from its own position in
//! a bounded ring; a subscriber that falls behind skips the oldest events
//! and the skip is logged and counted.

use crate::config::EventConfig;
use crate::metrics;
use crate::trace::Trace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// Wire envelope: `{"type": "trace" | "tokens", "data": {...}}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Trace(Trace),
    Tokens(TokenLevel),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenLevel {
    pub quota_id: String,
    pub tokens_remain: f64,
    pub capacity: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    pub fn new(config: &EventConfig) -> Self {
        let (tx, _) = broadcast::channel(config.buffer.max(1));
        Self { tx }
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        // No subscribers is the common case and not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> impl Stream<Item = Event> + Send + 'static {
        metrics::record_event_subscriber(true);
        let guard = SubscriberGuard;
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let _alive = &guard;
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, dropped oldest events");
                    metrics::record_events_dropped(skipped);
                    None
                }
            }
        })
    }
}

/// Keeps the subscriber gauge in step with live streams.
struct SubscriberGuard;

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        metrics::record_event_subscriber(false);
    }
}
