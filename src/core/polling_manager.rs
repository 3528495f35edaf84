//! Background polling for flag updates.
//!
//! The poll loop is a task owned by its [`PollingManager`]. Stopping the
//! manager cancels the pending tick and waits for the task to finish.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Called on each tick.
pub type PollCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct PollStats {
    polls: AtomicU64,
    consecutive_errors: AtomicU32,
}

pub struct PollingManager {
    interval: Duration,
    stats: Arc<PollStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stats: Arc::new(PollStats::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling. The first poll happens one interval from now.
    pub fn start(&self, on_poll: PollCallback) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let period = self.interval;
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                stats.polls.fetch_add(1, Ordering::Relaxed);
                let poll = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = on_poll() => result,
                };
                match poll {
                    Ok(()) => {
                        stats.consecutive_errors.store(0, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let errors = stats.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!("Poll failed (consecutive errors: {}): {}", errors, e);
                    }
                }
            }
            tracing::debug!("Polling stopped");
        }));

        tracing::debug!("Polling started with interval {:?}", period);
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn poll_count(&self) -> u64 {
        self.stats.polls.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.stats.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Stop polling. A stopped manager cannot be restarted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
