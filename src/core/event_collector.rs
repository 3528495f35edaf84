//! Buffering and batched delivery of conversion events.
//!
//! Events are flushed when the buffer reaches `max_buffer_size`, on every
//! `flush_interval`, on an explicit [`EventCollector::flush`], and once more
//! when the collector stops. Delivery is best-effort: a failed batch goes back
//! into the buffer, which holds at most twice `max_buffer_size` events.

use chrono::{SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub const DEFAULT_EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Interval between automatic flushes. Default: 30 seconds
    pub flush_interval: Duration,
    /// Buffered events that trigger a flush. Default: 100
    pub max_buffer_size: usize,
    /// Whether events are collected at all. Default: true
    pub enabled: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_EVENT_FLUSH_INTERVAL,
            max_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            enabled: true,
        }
    }
}

/// A conversion event to record against a flag.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEvent {
    pub flag_key: String,
    pub event_name: String,
    pub user_id: String,
    pub variation_id: Option<String>,
    pub value: Option<f64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TrackEvent {
    pub fn new(
        flag_key: impl Into<String>,
        event_name: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            flag_key: flag_key.into(),
            event_name: event_name.into(),
            user_id: user_id.into(),
            variation_id: None,
            value: None,
            metadata: HashMap::new(),
        }
    }

    pub fn variation_id(mut self, id: impl Into<String>) -> Self {
        self.variation_id = Some(id.into());
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An event as buffered and sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEvent {
    pub flag_key: String,
    pub event_name: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

impl From<TrackEvent> for TrackedEvent {
    fn from(event: TrackEvent) -> Self {
        Self {
            flag_key: event.flag_key,
            event_name: event.event_name,
            user_id: event.user_id,
            variation_id: event.variation_id,
            value: event.value,
            metadata: event.metadata,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Delivers one batch of events.
pub type EventSender = Arc<dyn Fn(Vec<TrackedEvent>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Shared {
    buffer: Mutex<Vec<TrackedEvent>>,
    sender: EventSender,
    max_buffer_size: usize,
    flush_signal: Notify,
}

impl Shared {
    async fn flush(&self) -> Result<()> {
        let events = std::mem::take(&mut *self.buffer.lock());
        if events.is_empty() {
            return Ok(());
        }

        let count = events.len();
        match (self.sender)(events.clone()).await {
            Ok(()) => {
                tracing::debug!("Flushed {} events", count);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to flush {} events: {}", count, e);
                self.rebuffer(events);
                Err(e)
            }
        }
    }

    /// Put a failed batch back in front, keeping only the newest events
    /// once the buffer would exceed twice its flush size.
    fn rebuffer(&self, mut events: Vec<TrackedEvent>) {
        let mut buffer = self.buffer.lock();
        events.append(&mut buffer);
        let limit = self.max_buffer_size.saturating_mul(2);
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        *buffer = events;
    }
}

pub struct EventCollector {
    config: EventsConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventCollector {
    pub fn new(config: EventsConfig, sender: EventSender) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::new()),
            sender,
            max_buffer_size: config.max_buffer_size.max(1),
            flush_signal: Notify::new(),
        });
        Self {
            config,
            shared,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start the background flush loop.
    pub fn start(&self) {
        if !self.config.enabled || self.cancel.is_cancelled() {
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let flush_interval = self.config.flush_interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = shared.flush_signal.notified() => {}
                }
                let _ = shared.flush().await;
            }
            tracing::debug!("Event collector stopped");
        }));
    }

    /// Buffer an event. A full buffer wakes the flush loop.
    pub fn track(&self, event: TrackEvent) {
        if !self.config.enabled {
            return;
        }
        let len = {
            let mut buffer = self.shared.buffer.lock();
            buffer.push(event.into());
            buffer.len()
        };
        if len >= self.shared.max_buffer_size {
            self.shared.flush_signal.notify_one();
        }
    }

    /// Send everything buffered now. Failed events stay buffered.
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Stop the flush loop and make a final best-effort flush.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(e) = self.shared.flush().await {
            tracing::debug!("Final event flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, RollgateError};
    use futures_util::FutureExt;

    fn failing_sender() -> EventSender {
        Arc::new(|_| {
            async { Err(RollgateError::new(ErrorCode::EventSendFailed, "offline")) }.boxed()
        })
    }

    #[test]
    fn test_tracked_event_wire_format() {
        let event: TrackedEvent = TrackEvent::new("checkout", "purchase", "u1")
            .value(9.5)
            .into();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["flagKey"], "checkout");
        assert_eq!(json["eventName"], "purchase");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["value"], 9.5);
        assert!(json.get("variationId").is_none());
        assert!(json.get("metadata").is_none());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_failed_flush_rebuffers_with_cap() {
        let collector = EventCollector::new(
            EventsConfig {
                max_buffer_size: 2,
                ..Default::default()
            },
            failing_sender(),
        );

        for i in 0..6 {
            collector.track(TrackEvent::new("f", format!("e{}", i), "u"));
        }
        assert!(collector.flush().await.is_err());
        assert_eq!(collector.buffered_len(), 4);

        let names: Vec<_> = collector
            .shared
            .buffer
            .lock()
            .iter()
            .map(|e| e.event_name.clone())
            .collect();
        assert_eq!(names, vec!["e2", "e3", "e4", "e5"]);
    }

    #[tokio::test]
    async fn test_disabled_collector_drops_events() {
        let collector = EventCollector::new(
            EventsConfig {
                enabled: false,
                ..Default::default()
            },
            failing_sender(),
        );
        collector.track(TrackEvent::new("f", "e", "u"));
        assert_eq!(collector.buffered_len(), 0);
    }
}
