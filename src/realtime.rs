use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message as WsMessage};

use crate::api::ApiClient;
use crate::types::{Message, RetryCounter, SendMessageRequest};

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Invalid realtime url: {0}")]
    InvalidUrl(String),
}

/// Lifecycle of the live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport dropped after a successful session; retrying under the bound.
    Reconnecting,
    /// Terminal: authentication kept failing after the bounded refresh cycles.
    AuthFailed,
}

/// What the manager reports to its owner. Failures never surface as panics
/// or returned errors into the embedding screen; they arrive here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// A new (deduplicated) message pushed by the server.
    Message(Message),
    /// The connected flag flipped.
    StatusChanged(bool),
    /// Server-side rejection delivered over the channel.
    ServerError(String),
    /// Retry bound exhausted on transport failures. Non-fatal: the screen
    /// keeps working over REST, just without live push.
    ConnectionLost { reason: String },
    /// Retry bound exhausted on authentication failures. Terminal.
    AuthFailed { attempts: u32 },
}

/// Reconnect policy knobs. Defaults match the production backend contract:
/// 5 attempts, 1s base delay growing exponentially, capped at 5s.
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Inbound frames, tagged by the `event` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
enum ServerFrame {
    #[serde(rename = "mensaje:nuevo")]
    NewMessage(Message),
    #[serde(rename = "error")]
    ServerError { message: String },
    #[serde(other)]
    Unknown,
}

/// Outbound frames.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
enum ClientFrame {
    #[serde(rename = "enviar_mensaje")]
    SendMessage(SendMessageRequest),
}

/// How one connection session ended, from the driver loop's point of view.
#[derive(Debug)]
enum SessionEnd {
    /// `disconnect()` was requested.
    Shutdown,
    /// The event receiver is gone; the owning screen closed.
    ChannelClosed,
    /// Server sent a close frame. Not auto-retried by the transport, so the
    /// driver reconnects proactively.
    ServerClosed,
    TransportLost(String),
    HandshakeFailed(String),
    /// Handshake rejected with 401/403: the token is stale or revoked.
    AuthRejected,
    /// A token refresh attempt failed.
    RefreshFailed,
}

/// Owns the live websocket for exactly one open conversation.
///
/// The bearer token rides the handshake URL query (the transport only
/// supports handshake-time auth parameters). One instance per conversation
/// screen, constructed and torn down by the screen controller: `connect()`
/// spawns a driver task that keeps the session alive under a bounded retry
/// policy, `disconnect()` tears everything down unconditionally, even with a
/// connect attempt mid-flight.
#[derive(Debug)]
pub struct RealtimeManager {
    // Handle to self for spawning the driver task from `&self`.
    weak: Weak<Self>,
    url: reqwest::Url,
    match_id: String,
    api: ApiClient,
    options: RealtimeOptions,
    state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
    driver_alive: AtomicBool,
    shutdown: AtomicBool,
    retries: Mutex<RetryCounter>,
    seen_ids: Mutex<HashSet<String>>,
    events: Sender<RealtimeEvent>,
    outbound: Mutex<Option<Sender<SendMessageRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeManager {
    pub fn new(
        url: &str,
        match_id: &str,
        api: ApiClient,
        options: RealtimeOptions,
        events: Sender<RealtimeEvent>,
    ) -> Result<Arc<Self>, RealtimeError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| RealtimeError::InvalidUrl(format!("{url}: {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RealtimeError::InvalidUrl(format!(
                "{url}: expected a ws:// or wss:// url"
            )));
        }
        let retries = RetryCounter::new(
            options.max_retries,
            options.base_delay.as_millis() as u64,
            options.max_delay.as_millis() as u64,
        );
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            url,
            match_id: match_id.to_string(),
            api,
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
            driver_alive: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            retries: Mutex::new(retries),
            seen_ids: Mutex::new(HashSet::new()),
            events,
            outbound: Mutex::new(None),
            worker: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Start (or restart) the driver task. No-op while a driver is already
    /// running or the session is connected; the in-progress guard prevents
    /// two concurrent connection attempts racing each other.
    pub fn connect(&self) {
        if self.driver_alive.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        // An explicit connect starts a fresh bounded retry cycle.
        lock(&self.retries).reset();

        let Some(manager) = self.weak.upgrade() else {
            self.driver_alive.store(false, Ordering::SeqCst);
            return;
        };
        let handle = tokio::spawn(async move {
            manager.run().await;
            manager.driver_alive.store(false, Ordering::SeqCst);
        });
        *lock(&self.worker) = Some(handle);
    }

    /// Tear the connection down unconditionally: aborts the driver even
    /// mid-handshake so no stale session can deliver into a closed screen.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        *lock(&self.outbound) = None;
        self.driver_alive.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Best-effort push over the live channel. Returns whether a frame was
    /// queued; callers must still send over REST, which stays authoritative.
    pub fn send_via_channel(&self, content: &str, recipient_id: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(sender) = lock(&self.outbound).clone() else {
            return false;
        };
        sender
            .try_send(SendMessageRequest {
                match_id: self.match_id.clone(),
                recipient_id: recipient_id.to_string(),
                content: content.to_string(),
            })
            .is_ok()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!(
                target: "flechazo_client::realtime",
                "Connection state {:?} -> {:?} (match {})",
                *state,
                next,
                self.match_id
            );
            *state = next;
        }
    }

    fn note_failure(&self, reason: &str) {
        *lock(&self.last_error) = Some(reason.to_string());
    }

    /// True the first time an id is seen; duplicate pushes are dropped here
    /// before they reach the store.
    fn note_seen(&self, id: &str) -> bool {
        lock(&self.seen_ids).insert(id.to_string())
    }

    async fn run(&self) {
        let mut was_connected = false;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            self.set_state(if was_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.open_session().await {
                SessionEnd::Shutdown | SessionEnd::ChannelClosed => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                SessionEnd::ServerClosed => {
                    was_connected = true;
                    self.note_failure("server closed the connection");
                    if self.backoff_or_give_up("server closed the connection").await {
                        return;
                    }
                }
                SessionEnd::TransportLost(reason) => {
                    was_connected = true;
                    self.note_failure(&reason);
                    if self.backoff_or_give_up(&reason).await {
                        return;
                    }
                }
                SessionEnd::HandshakeFailed(reason) => {
                    self.note_failure(&reason);
                    if self.backoff_or_give_up(&reason).await {
                        return;
                    }
                }
                SessionEnd::AuthRejected => {
                    tracing::debug!(
                        target: "flechazo_client::realtime",
                        "Handshake rejected, refreshing the access token"
                    );
                    match self.api.refresh_access_token().await {
                        // Fresh token: reopen immediately with it.
                        Ok(_) => continue,
                        Err(e) => {
                            self.note_failure(&e.to_string());
                            if self.auth_backoff_or_give_up().await {
                                return;
                            }
                        }
                    }
                }
                SessionEnd::RefreshFailed => {
                    self.note_failure("token refresh failed");
                    if self.auth_backoff_or_give_up().await {
                        return;
                    }
                }
            }
        }
    }

    /// Record a transport failure. Returns true when the driver must stop:
    /// the bound is exhausted and a non-fatal `ConnectionLost` was reported.
    async fn backoff_or_give_up(&self, reason: &str) -> bool {
        let (exhausted, delay) = {
            let mut retries = lock(&self.retries);
            (retries.record_failure(), retries.delay())
        };
        if exhausted {
            tracing::warn!(
                target: "flechazo_client::realtime",
                "Giving up on the realtime channel after {} attempts: {}",
                self.options.max_retries,
                reason
            );
            self.set_state(ConnectionState::Disconnected);
            let _ = self
                .events
                .send(RealtimeEvent::ConnectionLost {
                    reason: reason.to_string(),
                })
                .await;
            return true;
        }
        tokio::time::sleep(delay).await;
        false
    }

    /// Record a failed refresh-and-retry cycle. Returns true when the bound
    /// is exhausted and the terminal `AuthFailed` was reported.
    async fn auth_backoff_or_give_up(&self) -> bool {
        let (exhausted, attempts, delay) = {
            let mut retries = lock(&self.retries);
            let exhausted = retries.record_failure();
            (exhausted, retries.attempts(), retries.delay())
        };
        if exhausted {
            tracing::warn!(
                target: "flechazo_client::realtime",
                "Could not authenticate the realtime channel after {} attempts",
                attempts
            );
            self.set_state(ConnectionState::AuthFailed);
            let _ = self.events.send(RealtimeEvent::AuthFailed { attempts }).await;
            return true;
        }
        tokio::time::sleep(delay).await;
        false
    }

    async fn open_session(&self) -> SessionEnd {
        let token = match self.api.token_store().access_token() {
            Some(token) => token,
            // No token at all: try one refresh before failing.
            None => match self.api.refresh_access_token().await {
                Ok(token) => token,
                Err(_) => return SessionEnd::RefreshFailed,
            },
        };

        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", &token);

        let (ws, _response) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return SessionEnd::AuthRejected;
            }
            Err(e) => return SessionEnd::HandshakeFailed(e.to_string()),
        };

        lock(&self.retries).reset();
        self.set_state(ConnectionState::Connected);
        tracing::debug!(
            target: "flechazo_client::realtime",
            "Realtime channel connected (match {})",
            self.match_id
        );
        if self
            .events
            .send(RealtimeEvent::StatusChanged(true))
            .await
            .is_err()
        {
            return SessionEnd::ChannelClosed;
        }

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<SendMessageRequest>(32);
        *lock(&self.outbound) = Some(outbound_tx);

        let end = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break SessionEnd::Shutdown;
            }
            tokio::select! {
                request = outbound_rx.recv() => {
                    // The slot is only cleared on disconnect.
                    let Some(request) = request else { break SessionEnd::Shutdown };
                    let frame = ClientFrame::SendMessage(request);
                    match serde_json::to_string(&frame) {
                        Ok(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                break SessionEnd::TransportLost(e.to_string());
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                target: "flechazo_client::realtime",
                                "Could not serialize outbound frame: {}",
                                e
                            );
                        }
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !self.handle_frame(&text).await {
                            break SessionEnd::ChannelClosed;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            break SessionEnd::TransportLost("pong failed".to_string());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => break SessionEnd::ServerClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::TransportLost(e.to_string()),
                    None => break SessionEnd::TransportLost("stream ended".to_string()),
                }
            }
        };

        *lock(&self.outbound) = None;
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(RealtimeEvent::StatusChanged(false)).await;
        end
    }

    /// Returns false when the event receiver is gone and the driver should
    /// stop.
    async fn handle_frame(&self, text: &str) -> bool {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::NewMessage(message)) => {
                if !self.note_seen(&message.id) {
                    return true;
                }
                self.events
                    .send(RealtimeEvent::Message(message))
                    .await
                    .is_ok()
            }
            Ok(ServerFrame::ServerError { message }) => {
                tracing::warn!(
                    target: "flechazo_client::realtime",
                    "Server rejected over the realtime channel: {}",
                    message
                );
                self.events
                    .send(RealtimeEvent::ServerError(message))
                    .await
                    .is_ok()
            }
            Ok(ServerFrame::Unknown) => true,
            Err(e) => {
                tracing::warn!(
                    target: "flechazo_client::realtime",
                    "Ignoring malformed realtime frame: {}",
                    e
                );
                true
            }
        }
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
