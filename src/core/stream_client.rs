//! Push connection that keeps the flag set current.
//!
//! [`StreamClient`] owns one logical connection at a time. When a connection
//! fails or ends, it reports the error, waits its backoff (1s doubling to 30s)
//! and reconnects, until [`StreamClient::close`] is called. A successful open
//! resets the backoff.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::sse::{SseEvent, SseParser};
use crate::error::{ErrorCode, Result, RollgateError};
use crate::types::FlagSet;

pub const DEFAULT_STREAM_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_STREAM_MAX_BACKOFF: Duration = Duration::from_secs(30);

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens the raw event stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, user_id: Option<&str>) -> Result<ByteStream>;
}

/// `GET {stream_url}/api/v1/sdk/stream?token=...` over reqwest.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    stream_url: String,
    api_key: String,
}

impl HttpStreamTransport {
    pub fn new(stream_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            stream_url: stream_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, user_id: Option<&str>) -> Result<ByteStream> {
        let url = format!("{}/api/v1/sdk/stream", self.stream_url);
        let mut query = vec![("token", self.api_key.as_str())];
        if let Some(id) = user_id {
            query.push(("user_id", id));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("X-SDK-Name", crate::SDK_NAME)
            .header("X-SDK-Version", crate::SDK_VERSION)
            .send()
            .await
            .map_err(|e| {
                RollgateError::with_source(ErrorCode::StreamConnectFailed, "stream connection failed", e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RollgateError::from_status(status.as_u16(), "", None));
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| {
                RollgateError::with_source(ErrorCode::StreamReadError, "stream read failed", e)
            })
        });
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_STREAM_INITIAL_BACKOFF,
            max_backoff: DEFAULT_STREAM_MAX_BACKOFF,
        }
    }
}

/// A flag change decoded from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// The complete flag set; replaces whatever the client holds.
    Replace(FlagSet),
    /// A single flag changed.
    Patch { key: String, enabled: bool },
}

#[derive(Deserialize)]
struct FlagsPayload {
    flags: FlagSet,
}

#[derive(Deserialize)]
struct FlagUpdatePayload {
    key: String,
    enabled: bool,
}

/// Decode an event into a flag change. Unrecognized event types yield `Ok(None)`.
pub fn decode_event(event: &SseEvent) -> Result<Option<StreamMessage>> {
    let invalid = |e: serde_json::Error| {
        RollgateError::with_source(
            ErrorCode::StreamParseError,
            format!("malformed '{}' event", event.event),
            e,
        )
    };

    match event.event.as_str() {
        "init" | "flags" => {
            let payload: FlagsPayload = serde_json::from_str(&event.data).map_err(invalid)?;
            Ok(Some(StreamMessage::Replace(payload.flags)))
        }
        "flag-update" => {
            let payload: FlagUpdatePayload = serde_json::from_str(&event.data).map_err(invalid)?;
            Ok(Some(StreamMessage::Patch {
                key: payload.key,
                enabled: payload.enabled,
            }))
        }
        "flag-changed" => {
            tracing::debug!("Flag changed notification: {}", event.data);
            Ok(None)
        }
        _ => Ok(None),
    }
}

pub type FlagsCallback = Arc<dyn Fn(StreamMessage) + Send + Sync>;
pub type StreamErrorCallback = Arc<dyn Fn(&RollgateError) + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
struct Handlers {
    on_flags: Option<FlagsCallback>,
    on_error: Option<StreamErrorCallback>,
    on_connect: Option<ConnectCallback>,
}

pub struct StreamClient {
    transport: Arc<dyn StreamTransport>,
    config: StreamConfig,
    user_id: RwLock<Option<String>>,
    handlers: RwLock<Handlers>,
    connected: AtomicBool,
    reconnects: AtomicU32,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    pub fn new(transport: Arc<dyn StreamTransport>, config: StreamConfig) -> Self {
        Self {
            transport,
            config,
            user_id: RwLock::new(None),
            handlers: RwLock::new(Handlers::default()),
            connected: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn on_flags<F>(&self, callback: F)
    where
        F: Fn(StreamMessage) + Send + Sync + 'static,
    {
        self.handlers.write().on_flags = Some(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&RollgateError) + Send + Sync + 'static,
    {
        self.handlers.write().on_error = Some(Arc::new(callback));
    }

    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.write().on_connect = Some(Arc::new(callback));
    }

    /// User id sent on the next (re)connection.
    pub fn set_user(&self, user_id: Option<String>) {
        *self.user_id.write() = user_id.filter(|id| !id.is_empty());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Failed or ended connections so far.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start the connect loop. Does nothing if it is already running or the
    /// client was closed.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if self.cancel.is_cancelled() || task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Stop the connect loop and tear down the current connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = self.config.initial_backoff;

        while !self.cancel.is_cancelled() {
            let user_id = self.user_id.read().clone();
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.transport.open(user_id.as_deref()) => opened,
            };

            match opened {
                Ok(stream) => {
                    backoff = self.config.initial_backoff;
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!("Stream connected");
                    let on_connect = self.handlers.read().on_connect.clone();
                    if let Some(callback) = on_connect {
                        callback();
                    }

                    let ended = self.read_events(stream).await;
                    self.connected.store(false, Ordering::SeqCst);
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    match ended {
                        Ok(()) => tracing::debug!("Stream ended by server"),
                        Err(e) => self.report(&e),
                    }
                }
                Err(e) => self.report(&e),
            }

            self.reconnects.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Reconnecting stream in {:?}", backoff);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        tracing::debug!("Stream loop stopped");
    }

    async fn read_events(&self, mut stream: ByteStream) -> Result<()> {
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            for event in parser.feed(&chunk?) {
                self.handle_event(&event);
            }
        }
    }

    fn handle_event(&self, event: &SseEvent) {
        match decode_event(event) {
            Ok(Some(message)) => {
                let on_flags = self.handlers.read().on_flags.clone();
                if let Some(callback) = on_flags {
                    callback(message);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Ignoring stream event: {}", e);
                self.report(&e);
            }
        }
    }

    fn report(&self, error: &RollgateError) {
        tracing::warn!("Stream error: {}", error);
        let on_error = self.handlers.read().on_error.clone();
        if let Some(callback) = on_error {
            callback(error);
        }
    }
}
