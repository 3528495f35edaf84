//! Coalescing of concurrent identical operations.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ErrorCode, Result, RollgateError};

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;
type Registry<T> = Arc<Mutex<HashMap<String, (u64, SharedOutcome<T>)>>>;

/// Removes a registry entry when the owning task finishes, panics included.
struct Unregister<T> {
    registry: Registry<T>,
    key: String,
    id: u64,
}

impl<T> Drop for Unregister<T> {
    fn drop(&mut self) {
        let mut inflight = self.registry.lock();
        if inflight.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            inflight.remove(&self.key);
        }
    }
}

/// Runs at most one operation per key at a time.
///
/// Callers arriving while an operation is in flight await the same outcome.
/// The operation runs on its own task, so it completes and unregisters even
/// if every caller stops waiting.
pub struct RequestDeduplicator<T> {
    inflight: Registry<T>,
    next_id: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `operation` under `key`, or join the run already in flight.
    pub async fn dedupe<F, Fut>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let outcome = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some((_, existing)) => {
                    tracing::debug!("Joining in-flight request {}", key);
                    existing.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let guard = Unregister {
                        registry: Arc::clone(&self.inflight),
                        key: key.to_string(),
                        id,
                    };
                    let future = operation();
                    let task = tokio::spawn(async move {
                        let _guard = guard;
                        future.await
                    });
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RollgateError::new(
                                ErrorCode::TaskFailed,
                                format!("deduplicated request failed: {}", e),
                            ))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), (id, shared.clone()));
                    shared
                }
            }
        };

        outcome.await
    }

    pub fn is_inflight(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Forget all in-flight entries. Running operations still finish.
    pub fn clear(&self) {
        self.inflight.lock().clear();
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_completion() {
        let dedup = RequestDeduplicator::<u32>::new();
        let value = dedup.dedupe("k", || async { Ok(1) }).await.unwrap();
        assert_eq!(value, 1);

        tokio::task::yield_now().await;
        assert!(!dedup.is_inflight("k"));
    }

    #[tokio::test]
    async fn test_entry_removed_after_panic() {
        let dedup = RequestDeduplicator::<u32>::new();
        let result = dedup
            .dedupe("k", || async {
                if true {
                    panic!("boom");
                }
                Ok(1)
            })
            .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::TaskFailed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.inflight_count(), 0);
    }
}
