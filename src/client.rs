use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{
    CacheStats, EventCollector, EventSender, FlagCache, HttpStreamTransport, MetricsSnapshot,
    PollCallback, PollingManager, RequestDeduplicator, RollgateOptions, SdkMetrics, StreamClient,
    StreamMessage, StreamTransport, TelemetryCollector, TelemetrySender, TelemetryStats,
    TrackEvent,
};
use crate::error::{Result, RollgateError};
use crate::http::{
    is_retryable, CircuitBreaker, CircuitBreakerStats, CircuitState, FetchOutcome, HttpClient,
    Retryer,
};
use crate::types::{EvaluationDetail, EvaluationErrorKind, EvaluationReason, FlagSet, UserContext};

const FETCH_FLAGS_KEY: &str = "fetch-flags";

#[derive(Default)]
struct ClientState {
    flags: FlagSet,
    reasons: HashMap<String, EvaluationReason>,
    user: Option<UserContext>,
    etag: Option<String>,
    /// Bumped whenever the user changes. A fetch started under an older
    /// generation is discarded.
    generation: u64,
    ready: bool,
    closed: bool,
}

struct ClientInner {
    options: RollgateOptions,
    http: Arc<HttpClient>,
    cache: FlagCache,
    breaker: CircuitBreaker,
    retryer: Retryer,
    dedup: RequestDeduplicator<()>,
    metrics: Arc<SdkMetrics>,
    events: EventCollector,
    telemetry: TelemetryCollector,
    stream: Option<Arc<StreamClient>>,
    polling: PollingManager,
    state: RwLock<ClientState>,
    shutdown: CancellationToken,
}

/// Feature flag client.
///
/// Cheap to clone; clones share the same flags, cache and background tasks.
///
/// # Example
///
/// ```no_run
/// use rollgate::{RollgateClient, RollgateOptions, UserContext};
///
/// # async fn run() -> rollgate::Result<()> {
/// let client = RollgateClient::new(RollgateOptions::new("sdk_key"))?;
/// client.initialize().await?;
/// client.identify(UserContext::new("user-123")).await?;
///
/// if client.is_enabled("new-checkout", false) {
///     // ...
/// }
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RollgateClient {
    inner: Arc<ClientInner>,
}

impl RollgateClient {
    pub fn new(options: RollgateOptions) -> Result<Self> {
        let transport: Option<Arc<dyn StreamTransport>> = if options.enable_streaming {
            Some(Arc::new(HttpStreamTransport::new(
                options.effective_stream_url(),
                options.api_key.clone(),
            )))
        } else {
            None
        };
        Self::build(options, transport)
    }

    /// Create a client whose push stream reads from `transport`.
    /// Streaming is used regardless of `enable_streaming`.
    pub fn with_stream_transport(
        options: RollgateOptions,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self> {
        Self::build(options, Some(transport))
    }

    fn build(options: RollgateOptions, transport: Option<Arc<dyn StreamTransport>>) -> Result<Self> {
        options.validate()?;

        let http = Arc::new(HttpClient::new(&options)?);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(SdkMetrics::new());

        let breaker = CircuitBreaker::new(options.circuit_breaker.clone());
        let observer = Arc::clone(&metrics);
        breaker.on_state_change(move |change| observer.record_circuit_state(change.to));

        let sender_http = Arc::clone(&http);
        let sender: EventSender = Arc::new(move |events| {
            let http = Arc::clone(&sender_http);
            async move { http.send_events(&events).await }.boxed()
        });

        let telemetry_http = Arc::clone(&http);
        let telemetry_sender: TelemetrySender = Arc::new(move |payload| {
            let http = Arc::clone(&telemetry_http);
            async move { http.send_telemetry(&payload).await }.boxed()
        });

        let inner = ClientInner {
            http,
            cache: FlagCache::new(options.cache.clone()),
            breaker,
            retryer: Retryer::new(options.retry.clone()).with_cancellation(shutdown.clone()),
            dedup: RequestDeduplicator::new(),
            metrics,
            events: EventCollector::new(options.events.clone(), sender),
            telemetry: TelemetryCollector::new(options.telemetry.clone(), telemetry_sender),
            stream: transport
                .map(|transport| Arc::new(StreamClient::new(transport, options.stream.clone()))),
            polling: PollingManager::new(options.refresh_interval),
            state: RwLock::new(ClientState::default()),
            shutdown,
            options,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Load cached flags, fetch once and start background updates.
    ///
    /// A failed fetch is tolerated when the cache holds usable flags; the
    /// client then starts in a degraded state.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.ensure_open()?;
        if self.is_ready() {
            return Ok(());
        }

        if self.inner.options.cache.enabled {
            if let Err(e) = self.inner.cache.load() {
                tracing::warn!("Failed to load persisted flags: {}", e);
            }
            self.inner.apply_cached();
        }

        if let Err(e) = self.inner.refresh().await {
            if !self.inner.cache.has_any() {
                return Err(e);
            }
            tracing::warn!("Failed to fetch fresh flags, using cache: {}", e);
        }

        self.inner.state.write().ready = true;
        self.inner.events.start();
        self.inner.telemetry.start();

        if let Some(stream) = &self.inner.stream {
            self.inner.start_stream(stream);
        } else if !self.inner.options.refresh_interval.is_zero() {
            let weak = Arc::downgrade(&self.inner);
            let on_poll: PollCallback = Arc::new(move || {
                let weak = Weak::clone(&weak);
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.refresh().await,
                        None => Ok(()),
                    }
                }
                .boxed()
            });
            self.inner.polling.start(on_poll);
        }

        tracing::info!("Rollgate client initialized");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.read().ready
    }

    pub fn is_enabled(&self, flag_key: &str, default_value: bool) -> bool {
        self.is_enabled_detail(flag_key, default_value).value
    }

    /// Evaluate a flag with the reason for its value. Never fails; problems
    /// yield `default_value` and a reason saying why.
    pub fn is_enabled_detail(&self, flag_key: &str, default_value: bool) -> EvaluationDetail {
        self.inner.metrics.record_evaluation();
        let state = self.inner.state.read();

        if !state.ready {
            return EvaluationDetail::fallback(
                default_value,
                EvaluationReason::error(EvaluationErrorKind::ClientNotReady),
            );
        }

        match state.flags.get(flag_key) {
            None => EvaluationDetail::fallback(default_value, EvaluationReason::Unknown),
            Some(&value) => {
                self.inner.telemetry.record(flag_key, value);
                let reason = state
                    .reasons
                    .get(flag_key)
                    .cloned()
                    .unwrap_or(EvaluationReason::Fallthrough { in_rollout: value });
                EvaluationDetail::new(value, reason)
            }
        }
    }

    pub fn get_all_flags(&self) -> FlagSet {
        self.inner.state.read().flags.clone()
    }

    pub fn user(&self) -> Option<UserContext> {
        self.inner.state.read().user.clone()
    }

    /// Switch to `user` and refresh. Notifying the service of the new
    /// identity is best-effort.
    pub async fn identify(&self, user: UserContext) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.set_user(Some(user.clone()));

        if !user.id.is_empty() {
            if let Err(e) = self.inner.http.send_identify(&user).await {
                tracing::warn!("Failed to send identify: {}", e);
            }
        }

        self.inner.refresh().await
    }

    /// Drop the current user and refresh. The service is told the previous
    /// user left, on a best-effort basis.
    pub async fn reset(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let previous = self.inner.set_user(None);

        if let Some(previous) = previous.filter(|user| !user.id.is_empty()) {
            if let Err(e) = self.inner.http.send_identify(&previous.anonymized()).await {
                tracing::warn!("Failed to send reset identify: {}", e);
            }
        }

        self.inner.refresh().await
    }

    /// Fetch flags now. Concurrent callers share one request.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.refresh().await
    }

    /// Buffer a conversion event for batched delivery.
    pub fn track(&self, event: TrackEvent) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.events.track(event);
        Ok(())
    }

    pub async fn flush_events(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.events.flush().await
    }

    /// Send buffered evaluation counts now.
    pub async fn flush_telemetry(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.telemetry.flush().await
    }

    pub fn telemetry_stats(&self) -> TelemetryStats {
        self.inner.telemetry.stats()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.inner.breaker.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner
            .stream
            .as_ref()
            .is_some_and(|stream| stream.is_connected())
    }

    pub fn on_circuit_open<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.breaker.on_state_change(move |change| {
            if change.to == CircuitState::Open {
                callback();
            }
        });
    }

    pub fn on_circuit_closed<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.breaker.on_state_change(move |change| {
            if change.to == CircuitState::Closed {
                callback();
            }
        });
    }

    /// Stop background work and flush buffered events. Later calls are no-ops.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.inner.shutdown.cancel();
        self.inner.polling.stop().await;
        if let Some(stream) = &self.inner.stream {
            stream.close().await;
        }
        self.inner.events.stop().await;
        self.inner.telemetry.stop().await;
        tracing::info!("Rollgate client closed");
    }
}

impl ClientInner {
    fn ensure_open(&self) -> Result<()> {
        if self.state.read().closed {
            Err(RollgateError::closed())
        } else {
            Ok(())
        }
    }

    /// Swap the user, returning the previous one.
    fn set_user(&self, user: Option<UserContext>) -> Option<UserContext> {
        let user_id = user.as_ref().map(|u| u.id.clone());
        let previous = {
            let mut state = self.state.write();
            // The last ETag belongs to the previous user's flag set.
            state.etag = None;
            state.generation += 1;
            std::mem::replace(&mut state.user, user)
        };
        if let Some(stream) = &self.stream {
            stream.set_user(user_id);
        }
        previous
    }

    /// Fetch flags for the current user. Callers share a fetch only when it
    /// was started for the same user.
    async fn refresh(self: &Arc<Self>) -> Result<()> {
        let key = format!("{}:{}", FETCH_FLAGS_KEY, self.state.read().generation);
        let inner = Arc::clone(self);
        self.dedup
            .dedupe(&key, move || async move { inner.fetch_flags().await })
            .await
    }

    async fn fetch_flags(&self) -> Result<()> {
        if !self.breaker.is_allowing_requests() {
            tracing::warn!("Circuit breaker is open, using cached flags");
            self.apply_cached();
            return Err(RollgateError::circuit_open());
        }

        let started = Instant::now();
        let result = self
            .breaker
            .execute(|| async {
                self.retryer
                    .execute(|| self.fetch_once(), is_retryable)
                    .await
                    .into_result()
            })
            .await;

        match result {
            Ok(()) => {
                self.metrics.record_request(started.elapsed(), None);
                Ok(())
            }
            Err(e) => {
                if !e.is_circuit_open() {
                    self.metrics
                        .record_request(started.elapsed(), Some(e.category()));
                }
                self.apply_cached();
                Err(e)
            }
        }
    }

    async fn fetch_once(&self) -> Result<()> {
        let (user_id, etag, generation) = {
            let state = self.state.read();
            (
                state.user.as_ref().map(|user| user.id.clone()),
                state.etag.clone(),
                state.generation,
            )
        };

        let outcome = self
            .http
            .fetch_flags(user_id.as_deref(), etag.as_deref())
            .await?;

        if let FetchOutcome::Updated {
            flags,
            reasons,
            etag,
        } = outcome
        {
            tracing::debug!("Fetched {} flags", flags.len());
            {
                let mut state = self.state.write();
                if state.generation != generation {
                    tracing::debug!("Discarding flags fetched for a previous user");
                    return Ok(());
                }
                state.flags = flags.clone();
                state.reasons = reasons;
                if etag.is_some() {
                    state.etag = etag;
                }
            }
            if self.options.cache.enabled {
                self.cache.set(flags);
            }
        }
        Ok(())
    }

    /// Serve the cached set, counting the hit or miss.
    fn apply_cached(&self) {
        if !self.options.cache.enabled {
            return;
        }
        match self.cache.get() {
            Some(cached) => {
                self.metrics.record_cache_hit(cached.stale);
                self.state.write().flags = cached.flags;
            }
            None => self.metrics.record_cache_miss(),
        }
    }

    fn apply_stream_message(&self, message: StreamMessage) {
        match message {
            StreamMessage::Replace(flags) => {
                tracing::debug!("Stream replaced {} flags", flags.len());
                {
                    let mut state = self.state.write();
                    state.flags = flags.clone();
                    state.reasons.clear();
                }
                if self.options.cache.enabled {
                    self.cache.set(flags);
                }
            }
            StreamMessage::Patch { key, enabled } => {
                tracing::debug!("Stream updated flag {} = {}", key, enabled);
                let mut state = self.state.write();
                state.reasons.remove(&key);
                state.flags.insert(key, enabled);
            }
        }
    }

    fn start_stream(self: &Arc<Self>, stream: &Arc<StreamClient>) {
        let weak = Arc::downgrade(self);
        stream.on_flags(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_stream_message(message);
            }
        });
        stream.on_connect(|| tracing::info!("Flag stream connected"));
        stream.set_user(self.state.read().user.as_ref().map(|user| user.id.clone()));
        stream.start();
    }
}
