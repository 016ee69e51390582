use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::ApiClient;
use crate::error::{FlechazoError, Result};
use crate::realtime::{RealtimeEvent, RealtimeManager, RealtimeOptions};
use crate::types::{Message, SendMessageRequest, UserSummary};

mod store;

pub use store::{Delivery, MessageEntry};

use store::{temp_message_id, MessageStore};

const DEFAULT_PAGE_SIZE: u32 = 50;
const BANNER_TTL: Duration = Duration::from_secs(5);

/// What the embedding view should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenState {
    /// Initial history fetch in flight; no messages to show yet.
    Loading,
    /// Interactive: list rendered, sending and pagination enabled.
    Ready,
    /// An older page is in flight. The list stays rendered; further
    /// pagination requests are ignored until this one settles.
    LoadingOlder,
    /// The initial fetch failed. Only `reload` leaves this state.
    Error,
}

#[derive(Debug, Clone)]
struct Banner {
    text: String,
    sticky: bool,
    raised_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ConversationOptions {
    pub page_size: u32,
    pub realtime: RealtimeOptions,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            realtime: RealtimeOptions::default(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ScreenState,
    store: MessageStore,
    peer: Option<UserSummary>,
    total: u64,
    // Refreshed from fetch results only; realtime pushes grow the list and
    // the total together, so they never eat into the remaining history.
    has_more: bool,
    connected: bool,
    banner: Option<Banner>,
    error: Option<String>,
}

/// Drives one open conversation screen.
///
/// Owns the message store, the REST pagination cursor and the realtime
/// session for a single match. Sends go over REST, the single delivery
/// path; the realtime channel pushes the peer's messages. `close()` tears
/// everything down and any response that lands afterwards is discarded
/// instead of mutating a dead screen.
#[derive(Debug)]
pub struct ConversationController {
    api: ApiClient,
    match_id: String,
    page_size: u32,
    realtime: Arc<RealtimeManager>,
    inner: Mutex<Inner>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationController {
    /// Open the conversation: start the realtime session, fetch the initial
    /// history page and mark the peer's messages as read.
    ///
    /// A failed initial fetch leaves the controller in [`ScreenState::Error`]
    /// rather than failing construction, so the screen can offer a retry.
    pub async fn open(
        api: ApiClient,
        realtime_url: &str,
        match_id: &str,
        options: ConversationOptions,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let realtime = RealtimeManager::new(
            realtime_url,
            match_id,
            api.clone(),
            options.realtime,
            events_tx,
        )?;

        let controller = Arc::new(Self {
            api,
            match_id: match_id.to_string(),
            page_size: options.page_size,
            realtime,
            inner: Mutex::new(Inner {
                state: ScreenState::Loading,
                store: MessageStore::new(),
                peer: None,
                total: 0,
                has_more: false,
                connected: false,
                banner: None,
                error: None,
            }),
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump_events(
            Arc::downgrade(&controller),
            events_rx,
        ));
        *lock(&controller.pump) = Some(pump);

        // Fetch first: a push arriving mid-fetch would be wiped by the seed.
        controller.initial_load().await;
        controller.realtime.connect();
        Ok(controller)
    }

    /// Retry the initial fetch after a failure.
    pub async fn reload(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = lock(&self.inner);
            inner.state = ScreenState::Loading;
            inner.error = None;
        }
        self.initial_load().await;
    }

    async fn initial_load(&self) {
        let result = self
            .api
            .conversation(&self.match_id, self.page_size, None)
            .await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match result {
            Ok(detail) => {
                {
                    let mut inner = lock(&self.inner);
                    inner.store.seed(detail.messages);
                    inner.peer = Some(detail.user);
                    inner.total = detail.total;
                    inner.has_more = (inner.store.len() as u64) < detail.total;
                    inner.state = ScreenState::Ready;
                    inner.error = None;
                }
                self.mark_read_quietly().await;
            }
            Err(e) => {
                tracing::warn!(
                    target: "flechazo_client::conversation",
                    "Initial history fetch failed (match {}): {}",
                    self.match_id,
                    e
                );
                let mut inner = lock(&self.inner);
                inner.state = ScreenState::Error;
                inner.error = Some(e.to_string());
            }
        }
    }

    /// Fetch the page older than the oldest loaded message and prepend it.
    /// Returns how many messages were added, for scroll restoration.
    ///
    /// Ignored (returns 0) unless the screen is idle in `Ready` and more
    /// history exists; this also serializes concurrent pagination requests.
    pub async fn load_older(&self) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlechazoError::ConversationClosed);
        }
        let cursor = {
            let mut inner = lock(&self.inner);
            if inner.state != ScreenState::Ready || !inner.has_more {
                return Ok(0);
            }
            inner.state = ScreenState::LoadingOlder;
            inner.store.oldest_created_at()
        };

        let result = self
            .api
            .conversation(&self.match_id, self.page_size, cursor)
            .await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlechazoError::ConversationClosed);
        }

        let mut inner = lock(&self.inner);
        inner.state = ScreenState::Ready;
        match result {
            Ok(detail) => {
                // An empty page means no older history, whatever the counts
                // say.
                let exhausted = detail.messages.is_empty();
                let added = inner.store.prepend_older(detail.messages);
                inner.total = detail.total;
                inner.has_more = !exhausted && (inner.store.len() as u64) < detail.total;
                Ok(added)
            }
            Err(e) => {
                raise_banner(&mut inner, &format!("No se pudo cargar el historial: {e}"), false);
                Err(e.into())
            }
        }
    }

    /// Send a message with optimistic rendering.
    ///
    /// The trimmed text appears in the list immediately under a temporary
    /// id. Delivery goes over REST only (a realtime copy would make the
    /// backend store the message twice): on success the entry is replaced
    /// by the server's message, on failure it is removed and the error
    /// returned.
    pub async fn send(&self, content: &str) -> Result<Message> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlechazoError::ConversationClosed);
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(FlechazoError::EmptyMessage);
        }

        let (temp_id, request) = {
            let mut inner = lock(&self.inner);
            let Some(peer) = inner.peer.clone() else {
                return Err(FlechazoError::NotLoaded);
            };
            let sender_id = self
                .api
                .token_store()
                .user()
                .map(|u| u.id)
                .unwrap_or_default();
            let temp_id = temp_message_id();
            inner.store.add_optimistic(Message {
                id: temp_id.clone(),
                match_id: self.match_id.clone(),
                sender_id,
                recipient_id: peer.id.clone(),
                content: content.to_string(),
                read: false,
                created_at: chrono::Utc::now(),
            });
            let request = SendMessageRequest {
                match_id: self.match_id.clone(),
                recipient_id: peer.id,
                content: content.to_string(),
            };
            (temp_id, request)
        };

        let result = self.api.send_message(&request).await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlechazoError::ConversationClosed);
        }

        let mut inner = lock(&self.inner);
        match result {
            Ok(message) => {
                // The realtime echo may have landed first; count it once.
                if !inner.store.contains(&message.id) {
                    inner.total = inner.total.saturating_add(1);
                }
                inner.store.resolve_optimistic(&temp_id, Some(message.clone()));
                Ok(message)
            }
            Err(e) => {
                inner.store.resolve_optimistic(&temp_id, None);
                raise_banner(&mut inner, &format!("No se pudo enviar el mensaje: {e}"), false);
                Err(e.into())
            }
        }
    }

    /// Tear the screen down: stop the realtime session and the event pump.
    /// Safe to call more than once; in-flight responses are discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.realtime.disconnect();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        tracing::debug!(
            target: "flechazo_client::conversation",
            "Conversation closed (match {})",
            self.match_id
        );
    }

    pub fn state(&self) -> ScreenState {
        lock(&self.inner).state
    }

    pub fn messages(&self) -> Vec<MessageEntry> {
        lock(&self.inner).store.messages().to_vec()
    }

    pub fn peer(&self) -> Option<UserSummary> {
        lock(&self.inner).peer.clone()
    }

    /// Whether older history remains beyond the loaded window.
    pub fn has_more(&self) -> bool {
        lock(&self.inner).has_more
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    /// Error text of a failed initial fetch, while in `Error` state.
    pub fn error(&self) -> Option<String> {
        lock(&self.inner).error.clone()
    }

    /// Current transient notice, if one is active. Non-sticky banners expire
    /// on their own after a few seconds.
    pub fn banner(&self) -> Option<String> {
        let mut inner = lock(&self.inner);
        if let Some(banner) = &inner.banner {
            if !banner.sticky && banner.raised_at.elapsed() > BANNER_TTL {
                inner.banner = None;
            }
        }
        inner.banner.as_ref().map(|b| b.text.clone())
    }

    async fn mark_read_quietly(&self) {
        match self.api.mark_messages_read(&self.match_id).await {
            Ok(count) if count > 0 => {
                tracing::debug!(
                    target: "flechazo_client::conversation",
                    "Marked {} messages read (match {})",
                    count,
                    self.match_id
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "flechazo_client::conversation",
                    "Could not mark messages read (match {}): {}",
                    self.match_id,
                    e
                );
            }
        }
    }

    async fn pump_events(
        controller: Weak<Self>,
        mut events: mpsc::Receiver<RealtimeEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            if controller.closed.load(Ordering::SeqCst) {
                return;
            }
            controller.apply_event(event);
        }
    }

    fn apply_event(self: Arc<Self>, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Message(message) => {
                if message.match_id != self.match_id {
                    return;
                }
                let unread_for_me = !message.read
                    && self
                        .api
                        .token_store()
                        .user()
                        .map(|u| u.id == message.recipient_id)
                        .unwrap_or(false);
                {
                    let mut inner = lock(&self.inner);
                    if inner.store.upsert_incoming(message) {
                        inner.total = inner.total.saturating_add(1);
                    }
                }
                // The screen is open, so the peer's message is read on sight.
                if unread_for_me {
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move {
                        controller.mark_read_quietly().await;
                    });
                }
            }
            RealtimeEvent::StatusChanged(connected) => {
                lock(&self.inner).connected = connected;
            }
            RealtimeEvent::ServerError(message) => {
                raise_banner(&mut lock(&self.inner), &message, false);
            }
            RealtimeEvent::ConnectionLost { reason } => {
                tracing::warn!(
                    target: "flechazo_client::conversation",
                    "Realtime channel gone (match {}): {}",
                    self.match_id,
                    reason
                );
                raise_banner(
                    &mut lock(&self.inner),
                    "Sin conexión en tiempo real, los mensajes se actualizan al recargar",
                    false,
                );
            }
            RealtimeEvent::AuthFailed { .. } => {
                raise_banner(
                    &mut lock(&self.inner),
                    "Tu sesión expiró, vuelve a iniciar sesión",
                    true,
                );
            }
        }
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.close();
    }
}

fn raise_banner(inner: &mut Inner, text: &str, sticky: bool) {
    // A sticky banner is never displaced by a transient one.
    if let Some(current) = &inner.banner {
        if current.sticky && !sticky {
            return;
        }
    }
    inner.banner = Some(Banner {
        text: text.to_string(),
        sticky,
        raised_at: Instant::now(),
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
