use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat message, exactly as the backend represents it.
///
/// Wire field names are the backend's Spanish identifiers; the struct keeps
/// English names for the rest of the crate. `created_at` is the sole sort key
/// for the visible message list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "remitenteId")]
    pub sender_id: String,
    #[serde(rename = "destinatarioId")]
    pub recipient_id: String,
    #[serde(rename = "contenido")]
    pub content: String,
    #[serde(rename = "leido")]
    pub read: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Counterpart user as embedded in conversation payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: String,
    #[serde(rename = "nombre")]
    pub first_name: String,
    #[serde(rename = "apellido")]
    pub last_name: String,
    #[serde(rename = "fotoUrl", default)]
    pub photo_url: Option<String>,
}

/// Response of `GET /api/chat/conversacion/{matchId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationDetail {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "usuario")]
    pub user: UserSummary,
    #[serde(rename = "mensajes")]
    pub messages: Vec<Message>,
    /// Total number of messages the backend holds for this match, across all
    /// pages. Used to decide whether older history remains.
    pub total: u64,
}

/// One row of the conversation list (`GET /api/chat/conversaciones`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "usuario")]
    pub user: UserSummary,
    #[serde(rename = "ultimoMensaje")]
    pub last_message: Option<Message>,
    #[serde(rename = "mensajesNoLeidos")]
    pub unread_count: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /api/chat/mensaje` and of the realtime `enviar_mensaje` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    #[serde(rename = "matchId")]
    pub match_id: String,
    #[serde(rename = "destinatarioId")]
    pub recipient_id: String,
    #[serde(rename = "contenido")]
    pub content: String,
}

/// The last-known authenticated user, persisted alongside the access token so
/// a restart resumes the session. Fields the client does not model are kept
/// verbatim in `extra` and round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredUser {
    pub id: String,
    #[serde(rename = "nombre")]
    pub first_name: String,
    #[serde(rename = "apellido")]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "fotoUrl", default)]
    pub photo_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Bounded retry bookkeeping for the realtime connection.
///
/// Kept as a plain value so the reconnect policy is testable without any
/// transport attached.
#[derive(Debug, Clone)]
pub(crate) struct RetryCounter {
    attempt: u32,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryCounter {
    pub(crate) fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Record one failed cycle and report whether the bound is now exhausted.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        self.exhausted()
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Exponential delay for the next attempt, capped at `max_delay_ms`.
    pub(crate) fn delay(&self) -> std::time::Duration {
        let exp = self.attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}
