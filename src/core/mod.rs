pub mod cache;
pub mod config;
pub mod dedup;
pub mod event_collector;
pub mod metrics;
pub mod polling_manager;
pub mod sse;
pub mod storage;
pub mod stream_client;
pub mod telemetry;

pub use cache::{
    CacheConfig, CacheResult, CacheStats, FlagCache, DEFAULT_CACHE_STALE_TTL, DEFAULT_CACHE_TTL,
};
pub use config::{
    RollgateOptions, RollgateOptionsBuilder, DEFAULT_BASE_URL, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_TIMEOUT,
};
pub use dedup::RequestDeduplicator;
pub use event_collector::{
    EventCollector, EventSender, EventsConfig, TrackEvent, TrackedEvent,
    DEFAULT_EVENT_BUFFER_SIZE, DEFAULT_EVENT_FLUSH_INTERVAL,
};
pub use metrics::{MetricsSnapshot, SdkMetrics};
pub use polling_manager::{PollCallback, PollingManager};
pub use sse::{SseEvent, SseParser};
pub use storage::{CacheStorage, FileStorage, MemoryStorage, PersistedFlags};
pub use stream_client::{
    decode_event, ByteStream, HttpStreamTransport, StreamClient, StreamConfig, StreamMessage,
    StreamTransport,
};
pub use telemetry::{
    EvaluationCounts, TelemetryCollector, TelemetryConfig, TelemetryPayload, TelemetrySender,
    TelemetryStats, DEFAULT_TELEMETRY_BUFFER_SIZE, DEFAULT_TELEMETRY_FLUSH_INTERVAL,
};
