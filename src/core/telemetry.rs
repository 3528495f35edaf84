//! Per-flag evaluation counts reported to the flag service.
//!
//! Counts accumulate per flag key and are sent as one batch every
//! `flush_interval`, when `max_buffer_size` evaluations are buffered, on an
//! explicit flush, and once more on stop. A failed batch is merged back into
//! the buffer.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub const DEFAULT_TELEMETRY_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TELEMETRY_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Interval between automatic flushes. Default: 60 seconds
    pub flush_interval: Duration,
    /// Buffered evaluations that trigger a flush. Default: 1000
    pub max_buffer_size: usize,
    pub enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_TELEMETRY_FLUSH_INTERVAL,
            max_buffer_size: DEFAULT_TELEMETRY_BUFFER_SIZE,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationCounts {
    pub total: u64,
    #[serde(rename = "true")]
    pub enabled: u64,
    #[serde(rename = "false")]
    pub disabled: u64,
}

impl EvaluationCounts {
    fn record(&mut self, value: bool) {
        self.total += 1;
        if value {
            self.enabled += 1;
        } else {
            self.disabled += 1;
        }
    }

    fn merge(&mut self, other: &EvaluationCounts) {
        self.total += other.total;
        self.enabled += other.enabled;
        self.disabled += other.disabled;
    }
}

/// Body of `POST /telemetry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub evaluations: HashMap<String, EvaluationCounts>,
    /// Time covered by this batch.
    pub period_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub flag_count: usize,
    pub evaluation_count: u64,
}

/// Delivers one telemetry batch.
pub type TelemetrySender =
    Arc<dyn Fn(TelemetryPayload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Buffer {
    evaluations: HashMap<String, EvaluationCounts>,
    total: u64,
    last_flush: Instant,
}

struct Shared {
    buffer: Mutex<Buffer>,
    sender: TelemetrySender,
    max_buffer_size: u64,
    flushing: AtomicBool,
    flush_signal: Notify,
}

impl Shared {
    async fn flush(&self) -> Result<()> {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.send_buffered().await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn send_buffered(&self) -> Result<()> {
        let payload = {
            let mut buffer = self.buffer.lock();
            if buffer.evaluations.is_empty() {
                return Ok(());
            }
            let period_ms = buffer.last_flush.elapsed().as_millis() as u64;
            buffer.total = 0;
            buffer.last_flush = Instant::now();
            TelemetryPayload {
                evaluations: std::mem::take(&mut buffer.evaluations),
                period_ms,
            }
        };

        let flags = payload.evaluations.len();
        match (self.sender)(payload.clone()).await {
            Ok(()) => {
                tracing::debug!("Flushed telemetry for {} flags", flags);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to flush telemetry: {}", e);
                self.restore(payload.evaluations);
                Err(e)
            }
        }
    }

    fn restore(&self, evaluations: HashMap<String, EvaluationCounts>) {
        let mut buffer = self.buffer.lock();
        for (key, counts) in evaluations {
            buffer.total += counts.total;
            buffer.evaluations.entry(key).or_default().merge(&counts);
        }
    }
}

pub struct TelemetryCollector {
    config: TelemetryConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryCollector {
    pub fn new(config: TelemetryConfig, sender: TelemetrySender) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                evaluations: HashMap::new(),
                total: 0,
                last_flush: Instant::now(),
            }),
            sender,
            max_buffer_size: config.max_buffer_size.max(1) as u64,
            flushing: AtomicBool::new(false),
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
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = shared.flush_signal.notified() => {}
                }
                let _ = shared.flush().await;
            }
            tracing::debug!("Telemetry collector stopped");
        }));
    }

    /// Count one evaluation of `flag_key`.
    pub fn record(&self, flag_key: &str, value: bool) {
        if !self.config.enabled {
            return;
        }
        let total = {
            let mut buffer = self.shared.buffer.lock();
            match buffer.evaluations.get_mut(flag_key) {
                Some(counts) => counts.record(value),
                None => {
                    let mut counts = EvaluationCounts::default();
                    counts.record(value);
                    buffer.evaluations.insert(flag_key.to_string(), counts);
                }
            }
            buffer.total += 1;
            buffer.total
        };
        if total >= self.shared.max_buffer_size {
            self.shared.flush_signal.notify_one();
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    pub fn stats(&self) -> TelemetryStats {
        let buffer = self.shared.buffer.lock();
        TelemetryStats {
            flag_count: buffer.evaluations.len(),
            evaluation_count: buffer.total,
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(e) = self.shared.flush().await {
            tracing::debug!("Final telemetry flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, RollgateError};
    use futures_util::FutureExt;

    fn recording_sender(sent: Arc<Mutex<Vec<TelemetryPayload>>>) -> TelemetrySender {
        Arc::new(move |payload| {
            sent.lock().push(payload);
            async { Ok(()) }.boxed()
        })
    }

    fn failing_sender() -> TelemetrySender {
        Arc::new(|_| {
            async { Err(RollgateError::new(ErrorCode::EventSendFailed, "offline")) }.boxed()
        })
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = TelemetryPayload {
            evaluations: HashMap::from([(
                "beta".to_string(),
                EvaluationCounts {
                    total: 3,
                    enabled: 2,
                    disabled: 1,
                },
            )]),
            period_ms: 1500,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "evaluations": {"beta": {"total": 3, "true": 2, "false": 1}},
                "period_ms": 1500
            })
        );
    }

    #[tokio::test]
    async fn test_counts_per_flag_and_clears_on_flush() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let collector =
            TelemetryCollector::new(TelemetryConfig::default(), recording_sender(Arc::clone(&sent)));

        collector.record("a", true);
        collector.record("a", false);
        collector.record("a", true);
        collector.record("b", false);
        assert_eq!(
            collector.stats(),
            TelemetryStats {
                flag_count: 2,
                evaluation_count: 4
            }
        );

        collector.flush().await.unwrap();
        assert_eq!(collector.stats(), TelemetryStats::default());

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].evaluations["a"],
            EvaluationCounts {
                total: 3,
                enabled: 2,
                disabled: 1
            }
        );
        assert_eq!(sent[0].evaluations["b"].disabled, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_merges_counts_back() {
        let collector = TelemetryCollector::new(TelemetryConfig::default(), failing_sender());

        collector.record("a", true);
        assert!(collector.flush().await.is_err());
        collector.record("a", false);

        assert_eq!(collector.stats().evaluation_count, 2);
        let buffer = collector.shared.buffer.lock();
        assert_eq!(
            buffer.evaluations["a"],
            EvaluationCounts {
                total: 2,
                enabled: 1,
                disabled: 1
            }
        );
    }

    #[tokio::test]
    async fn test_empty_buffer_sends_nothing() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let collector =
            TelemetryCollector::new(TelemetryConfig::default(), recording_sender(Arc::clone(&sent)));

        collector.flush().await.unwrap();
        collector.stop().await;
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_buffer_wakes_flush_loop() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let collector = TelemetryCollector::new(
            TelemetryConfig {
                max_buffer_size: 3,
                ..Default::default()
            },
            recording_sender(Arc::clone(&sent)),
        );
        collector.start();

        for _ in 0..3 {
            collector.record("a", true);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sent.lock().len(), 1);
        assert_eq!(collector.stats().evaluation_count, 0);
        collector.stop().await;
    }

    #[test]
    fn test_disabled_collector_ignores_evaluations() {
        let collector = TelemetryCollector::new(
            TelemetryConfig {
                enabled: false,
                ..Default::default()
            },
            failing_sender(),
        );
        collector.record("a", true);
        assert_eq!(collector.stats(), TelemetryStats::default());
    }
}
