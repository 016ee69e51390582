use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::Deserialize;

use crate::types::{ConversationDetail, ConversationSummary, Message, SendMessageRequest};

use super::{ApiClient, Result};

#[derive(Debug, Deserialize)]
struct ConversationsEnvelope {
    #[serde(rename = "conversaciones")]
    conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
struct SentMessageEnvelope {
    #[serde(rename = "mensaje")]
    message: Message,
}

#[derive(Debug, Deserialize)]
struct MarkReadEnvelope {
    #[serde(rename = "cantidad")]
    count: u64,
}

impl ApiClient {
    /// Fetch one page of a conversation, newest-first window of `limit`
    /// messages. `before` is the pagination cursor: only messages strictly
    /// older than it are returned.
    pub async fn conversation(
        &self,
        match_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<ConversationDetail> {
        let path = format!("/api/chat/conversacion/{match_id}");
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }
        self.request_json(Method::GET, &path, &query, None).await
    }

    /// List the user's open conversations, most recently active first.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        let envelope: ConversationsEnvelope = self
            .request_json(Method::GET, "/api/chat/conversaciones", &[], None)
            .await?;
        Ok(envelope.conversations)
    }

    /// Send a message. This is the authoritative delivery path; the realtime
    /// channel only shortcuts latency.
    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<Message> {
        let body = serde_json::json!(request);
        let envelope: SentMessageEnvelope = self
            .request_json(Method::POST, "/api/chat/mensaje", &[], Some(&body))
            .await?;
        Ok(envelope.message)
    }

    /// Mark every message addressed to the current user in this match as
    /// read. Returns how many the backend flipped.
    pub async fn mark_messages_read(&self, match_id: &str) -> Result<u64> {
        let path = format!("/api/chat/mensajes/leidos/{match_id}");
        let envelope: MarkReadEnvelope = self
            .request_json(Method::PUT, &path, &[], None)
            .await?;
        Ok(envelope.count)
    }
}
