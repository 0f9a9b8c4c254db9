//! Zulip event-queue client — resumable long-polling.
//!
//! Registers a server-side event queue, long-polls `/api/v1/events`
//! with the held queue id and watermark, normalizes private-message
//! events, and hands them to a caller-supplied handler one at a time.
//! Queue expiry (`BAD_EVENT_QUEUE_ID`) is a known recoverable
//! condition: the cursor is discarded wholesale and registration
//! restarts immediately. Other failures back off on fixed delays and
//! retry until [`QueueClient::stop`] is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Zulip connection settings.
#[derive(Clone)]
pub struct ZulipConfig {
    /// Server base URL, e.g. `https://your-org.zulipchat.com`.
    pub site: String,
    /// Bot (or user) email used for basic auth.
    pub email: String,
    /// API key paired with the email.
    pub api_key: String,
}

impl std::fmt::Debug for ZulipConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZulipConfig")
            .field("site", &self.site)
            .field("email", &self.email)
            .field("api_key", &"__REDACTED__")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Event-source transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server reported the held queue id invalid or expired.
    /// Recoverable by re-registration, not a failure.
    #[error("event queue expired")]
    QueueExpired,
    /// The API returned a non-success status.
    #[error("Zulip API error: {status} {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },
    /// HTTP transport error (includes request timeouts).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by the polling loop itself.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The per-message handler failed and the halt policy is active.
    #[error("message handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Registration response subset.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    /// Opaque queue identifier issued by the server.
    pub queue_id: String,
    /// Initial watermark; `-1` when the server omits it.
    #[serde(default = "fresh_watermark")]
    pub last_event_id: i64,
}

fn fresh_watermark() -> i64 {
    -1
}

/// One event from the queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueEvent {
    /// Monotonic event id, the watermark unit.
    pub id: i64,
    /// Event category (`"message"`, `"heartbeat"`, …).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Message payload, present for message events.
    #[serde(default)]
    pub message: Option<WireMessage>,
}

/// Message payload as delivered by the events API.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    /// Message id, used for the deep link.
    pub id: i64,
    /// Sender display name.
    pub sender_full_name: String,
    /// Sender email.
    pub sender_email: String,
    /// Raw markdown content.
    pub content: String,
    /// Conversation participants. Streams put a string here instead
    /// of an array; anything non-array decodes as empty.
    #[serde(default, deserialize_with = "recipients_or_empty")]
    pub display_recipient: Vec<Recipient>,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Message type (`"private"` or `"stream"`).
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// One conversation participant.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    /// Participant user id.
    pub id: i64,
    /// Participant email.
    pub email: String,
    /// Participant display name.
    pub full_name: String,
}

fn recipients_or_empty<'de, D>(deserializer: D) -> Result<Vec<Recipient>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Array(_) => {
            serde_json::from_value(value).map_err(serde::de::Error::custom)
        }
        _ => Ok(Vec::new()),
    }
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<QueueEvent>,
}

// ---------------------------------------------------------------------------
// Normalized output
// ---------------------------------------------------------------------------

/// A private message, normalized for the caller's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    /// Message id (ordering and deep-link construction).
    pub id: i64,
    /// Sender display name.
    pub sender_full_name: String,
    /// Sender email.
    pub sender_email: String,
    /// Raw markdown content.
    pub content: String,
    /// Conversation participants, in server order.
    pub recipients: Vec<Recipient>,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl PrivateMessage {
    fn from_wire(message: WireMessage) -> Self {
        Self {
            id: message.id,
            sender_full_name: message.sender_full_name,
            sender_email: message.sender_email,
            content: message.content,
            recipients: message.display_recipient,
            timestamp: message.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Event-source protocol: registration plus one long-poll cycle.
///
/// The polling loop only talks to this trait, so tests drive it with
/// a scripted transport.
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync {
    /// Register a fresh queue for message events.
    async fn register(&self) -> Result<Registration, TransportError>;

    /// Long-poll for events newer than `last_event_id`. May block
    /// server-side until an event arrives or its own timeout elapses.
    async fn poll(
        &self,
        queue_id: &str,
        last_event_id: i64,
    ) -> Result<Vec<QueueEvent>, TransportError>;
}

/// Zulip's server holds an idle poll open for up to this long.
const LONG_POLL_WINDOW_SECS: u64 = 90;

/// Extra seconds on the HTTP timeout beyond the long-poll window, so
/// the socket stays open while the server holds the request.
const POLL_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Marker the server embeds in the error body when a queue id is no
/// longer valid. Matched on the body, not the status code.
const BAD_QUEUE_MARKER: &str = "BAD_EVENT_QUEUE_ID";

/// reqwest-backed transport against a real Zulip server.
pub struct ZulipTransport {
    config: ZulipConfig,
    client: reqwest::Client,
}

impl ZulipTransport {
    /// Create a transport for the given server.
    pub fn new(config: ZulipConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl EventTransport for ZulipTransport {
    async fn register(&self) -> Result<Registration, TransportError> {
        let url = format!("{}/api/v1/register", self.config.site);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .form(&[("event_types", r#"["message"]"#)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json::<Registration>().await?)
    }

    async fn poll(
        &self,
        queue_id: &str,
        last_event_id: i64,
    ) -> Result<Vec<QueueEvent>, TransportError> {
        let url = format!("{}/api/v1/events", self.config.site);
        let timeout =
            Duration::from_secs(LONG_POLL_WINDOW_SECS.saturating_add(POLL_TIMEOUT_MARGIN_SECS));

        // dont_block is deliberately omitted so the server long-polls.
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .query(&[
                ("queue_id", queue_id),
                ("last_event_id", &last_event_id.to_string()),
            ])
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.contains(BAD_QUEUE_MARKER) {
                return Err(TransportError::QueueExpired);
            }
            return Err(TransportError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json::<EventsResponse>().await?.events)
    }
}

// ---------------------------------------------------------------------------
// Queue client
// ---------------------------------------------------------------------------

/// Cursor into the remote event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCursor {
    /// Queue identifier from registration.
    pub queue_id: String,
    /// Highest event id consumed so far; only ever moves forward.
    pub last_event_id: i64,
}

/// What to do when the per-message handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerErrorPolicy {
    /// Log the failure and keep polling (liveness default — the
    /// watermark has already advanced, the event is not redelivered).
    #[default]
    LogAndContinue,
    /// Stop the loop and surface the handler error.
    Halt,
}

/// Delay before retrying after a failed poll cycle.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Delay before retrying after a failed registration attempt.
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Resumable long-polling consumer of one event queue.
///
/// One logical loop per instance. `run` is guarded against concurrent
/// starts; `stop` is cooperative and leaves the cursor in place so a
/// later `run` resumes where it left off.
pub struct QueueClient<T: EventTransport> {
    transport: T,
    cursor: Mutex<Option<QueueCursor>>,
    running: AtomicBool,
    /// Sender email to suppress when self-message filtering is on.
    ignore_self: Option<String>,
    on_handler_error: HandlerErrorPolicy,
}

impl<T: EventTransport> QueueClient<T> {
    /// Create a client with no cursor and the given failure policy.
    ///
    /// `ignore_self` suppresses messages whose sender email matches
    /// (case-insensitive); `None` disables the filter, matching the
    /// reference behavior.
    pub fn new(
        transport: T,
        ignore_self: Option<String>,
        on_handler_error: HandlerErrorPolicy,
    ) -> Self {
        Self {
            transport,
            cursor: Mutex::new(None),
            running: AtomicBool::new(false),
            ignore_self,
            on_handler_error,
        }
    }

    /// Snapshot of the held cursor, if any.
    pub fn cursor(&self) -> Option<QueueCursor> {
        self.cursor.lock().ok().and_then(|guard| guard.clone())
    }

    /// Request the loop to exit after its current operation. Does not
    /// interrupt an in-flight long poll; the cursor is retained.
    pub fn stop(&self) {
        info!("queue client stop requested");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the polling loop until [`stop`](Self::stop).
    ///
    /// Each private message is passed to `handler` and awaited to
    /// completion before the next event is touched — delivery is
    /// strictly ordered within a batch, never concurrent. Returns
    /// `Ok(())` on cooperative stop, or a handler error under
    /// [`HandlerErrorPolicy::Halt`].
    ///
    /// A second concurrent call is a no-op while the first is live.
    pub async fn run<H, Fut>(&self, mut handler: H) -> Result<(), QueueError>
    where
        H: FnMut(PrivateMessage) -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("queue client already running, ignoring second start");
            return Ok(());
        }

        let result = self.poll_loop(&mut handler).await;
        self.running.store(false, Ordering::SeqCst);
        info!("queue polling loop ended");
        result
    }

    async fn poll_loop<H, Fut>(&self, handler: &mut H) -> Result<(), QueueError>
    where
        H: FnMut(PrivateMessage) -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        while self.running.load(Ordering::SeqCst) {
            // Register when no cursor is held (fresh start or after
            // expiry). Failure backs off and retries, unbounded.
            let cursor = match self.cursor() {
                Some(cursor) => cursor,
                None => match self.transport.register().await {
                    Ok(reg) => {
                        let cursor = QueueCursor {
                            queue_id: reg.queue_id,
                            last_event_id: reg.last_event_id,
                        };
                        info!(
                            queue_id = %cursor.queue_id,
                            last_event_id = cursor.last_event_id,
                            "event queue registered"
                        );
                        self.set_cursor(Some(cursor.clone()));
                        cursor
                    }
                    Err(e) => {
                        warn!(error = %e, "queue registration failed, backing off");
                        tokio::time::sleep(REGISTER_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            debug!(
                queue_id = %cursor.queue_id,
                last_event_id = cursor.last_event_id,
                "polling for events"
            );
            match self
                .transport
                .poll(&cursor.queue_id, cursor.last_event_id)
                .await
            {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!(count = events.len(), "received events");
                    }
                    self.consume_batch(events, handler).await?;
                }
                Err(TransportError::QueueExpired) => {
                    // Known recoverable condition: drop the cursor and
                    // re-register immediately, no backoff.
                    warn!(queue_id = %cursor.queue_id, "event queue expired, re-registering");
                    self.set_cursor(None);
                }
                Err(e) => {
                    warn!(error = %e, "poll failed, backing off");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }

        Ok(())
    }

    /// Advance the watermark over every event; deliver private
    /// messages in order, one at a time.
    async fn consume_batch<H, Fut>(
        &self,
        events: Vec<QueueEvent>,
        handler: &mut H,
    ) -> Result<(), QueueError>
    where
        H: FnMut(PrivateMessage) -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        for event in events {
            // The watermark takes the max, so duplicates or
            // out-of-order ids in a batch never move it backward.
            self.advance_watermark(event.id);

            let Some(message) = event.message else {
                continue;
            };
            if event.kind != "message" || message.kind != "private" {
                continue;
            }
            if let Some(own) = &self.ignore_self {
                if message.sender_email.eq_ignore_ascii_case(own) {
                    debug!(sender = %message.sender_email, "ignoring message from self");
                    continue;
                }
            }

            let normalized = PrivateMessage::from_wire(message);
            info!(
                id = normalized.id,
                sender = %normalized.sender_full_name,
                "received private message"
            );
            if let Err(e) = handler(normalized).await {
                match self.on_handler_error {
                    HandlerErrorPolicy::LogAndContinue => {
                        warn!(error = %e, "message handler failed, continuing");
                    }
                    HandlerErrorPolicy::Halt => return Err(QueueError::Handler(e)),
                }
            }
        }
        Ok(())
    }

    fn advance_watermark(&self, event_id: i64) {
        if let Ok(mut guard) = self.cursor.lock() {
            if let Some(cursor) = guard.as_mut() {
                cursor.last_event_id = cursor.last_event_id.max(event_id);
            }
        }
    }

    fn set_cursor(&self, cursor: Option<QueueCursor>) {
        if let Ok(mut guard) = self.cursor.lock() {
            *guard = cursor;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
