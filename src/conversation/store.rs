use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::Message;

/// Delivery state of one entry in the visible list.
///
/// A message is either confirmed by the server (it arrived via fetch or
/// realtime push, or a send was acknowledged) or optimistic: shown locally
/// under a temporary id while its send is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Optimistic,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub message: Message,
    pub delivery: Delivery,
}

/// Generate a temporary id for an optimistic message. The `temp-` prefix
/// keeps the namespace disjoint from server-assigned ids.
pub(crate) fn temp_message_id() -> String {
    format!("temp-{}", Uuid::new_v4())
}

fn confirmed(message: Message) -> MessageEntry {
    MessageEntry {
        message,
        delivery: Delivery::Confirmed,
    }
}

/// Single source of truth for the ordered message list of one conversation.
///
/// It reconciles three producers that complete in arbitrary order: paginated
/// history fetches, realtime pushes, and locally-originated optimistic sends.
/// Every mutation re-establishes the list invariant: unique ids, ascending
/// `created_at`, ties stable by insertion order.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<MessageEntry>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.message.id == id)
    }

    /// Timestamp of the oldest loaded message, used as the cursor for the
    /// next older-page fetch.
    pub fn oldest_created_at(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.message.created_at)
    }

    /// Replace the list with an initial page of confirmed messages.
    pub fn seed(&mut self, messages: Vec<Message>) {
        self.entries = messages.into_iter().map(confirmed).collect();
        self.normalize();
    }

    /// Merge an older history page at the head. Messages already present
    /// (a prior realtime push can overlap a page fetch) are skipped.
    /// Returns how many entries were actually added, so the embedding view
    /// can restore its scroll offset.
    pub fn prepend_older(&mut self, messages: Vec<Message>) -> usize {
        let mut head: Vec<MessageEntry> = Vec::with_capacity(messages.len());
        for message in messages {
            if !self.contains(&message.id) && !head.iter().any(|e| e.message.id == message.id) {
                head.push(confirmed(message));
            }
        }
        let added = head.len();
        head.append(&mut self.entries);
        self.entries = head;
        self.normalize();
        added
    }

    /// Insert or replace a server-confirmed message. Returns whether a new
    /// entry was inserted (false means an existing one was updated).
    ///
    /// Replacement covers the realtime echo of a message the client already
    /// holds, arriving with authoritative fields (read flag, timestamps).
    pub fn upsert_incoming(&mut self, message: Message) -> bool {
        let inserted = match self
            .entries
            .iter_mut()
            .find(|e| e.message.id == message.id)
        {
            Some(existing) => {
                existing.message = message;
                existing.delivery = Delivery::Confirmed;
                false
            }
            None => {
                self.entries.push(confirmed(message));
                true
            }
        };
        self.normalize();
        inserted
    }

    /// Insert a locally-originated message before its send is acknowledged.
    /// The message must carry a temporary id disjoint from server ids.
    pub fn add_optimistic(&mut self, message: Message) {
        self.entries.push(MessageEntry {
            message,
            delivery: Delivery::Optimistic,
        });
        self.normalize();
    }

    /// Settle an optimistic entry: replace it with the confirmed message on
    /// a successful send, or remove it outright (`None`) on failure.
    ///
    /// When the confirmed message already arrived via realtime push before
    /// the send response, the temp entry is dropped and the existing entry
    /// updated, so both arrival orders converge on a single entry.
    /// Returns whether the temp id was found.
    pub fn resolve_optimistic(&mut self, temp_id: &str, confirmed_message: Option<Message>) -> bool {
        let Some(position) = self
            .entries
            .iter()
            .position(|e| e.delivery == Delivery::Optimistic && e.message.id == temp_id)
        else {
            return false;
        };
        self.entries.remove(position);
        if let Some(message) = confirmed_message {
            self.upsert_incoming(message);
        }
        true
    }

    fn normalize(&mut self) {
        let mut seen: HashSet<String> = HashSet::with_capacity(self.entries.len());
        self.entries.retain(|e| seen.insert(e.message.id.clone()));
        // Stable sort: equal timestamps keep their insertion order.
        self.entries.sort_by_key(|e| e.message.created_at);
    }

    #[cfg(test)]
    fn assert_invariant(&self) {
        let mut seen = HashSet::new();
        for window in self.entries.windows(2) {
            assert!(
                window[0].message.created_at <= window[1].message.created_at,
                "list must be ascending by created_at"
            );
        }
        for entry in &self.entries {
            assert!(
                seen.insert(entry.message.id.clone()),
                "duplicate id {} in the list",
                entry.message.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            match_id: "m1".to_string(),
            sender_id: "u1".to_string(),
            recipient_id: "u2".to_string(),
            content: format!("mensaje {id}"),
            read: false,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn ids(store: &MessageStore) -> Vec<&str> {
        store
            .messages()
            .iter()
            .map(|e| e.message.id.as_str())
            .collect()
    }

    #[test]
    fn seed_sorts_and_dedupes() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("b", 20), msg("a", 10), msg("b", 20)]);
        assert_eq!(ids(&store), vec!["a", "b"]);
        store.assert_invariant();
    }

    #[test]
    fn prepend_older_lands_at_the_head() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10), msg("b", 20)]);

        let added = store.prepend_older(vec![msg("c", 5)]);

        assert_eq!(added, 1);
        assert_eq!(ids(&store), vec!["c", "a", "b"]);
        store.assert_invariant();
    }

    #[test]
    fn prepend_older_skips_messages_already_pushed() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10), msg("b", 20)]);

        // "a" appeared both in a realtime push and in the older page.
        let added = store.prepend_older(vec![msg("z", 1), msg("a", 10)]);

        assert_eq!(added, 1);
        assert_eq!(ids(&store), vec!["z", "a", "b"]);
        store.assert_invariant();
    }

    #[test]
    fn upsert_is_idempotent_on_duplicate_delivery() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10)]);

        let mut echo = msg("a", 10);
        echo.read = true;
        assert!(!store.upsert_incoming(echo.clone()));
        assert!(!store.upsert_incoming(echo));

        assert_eq!(store.len(), 1);
        assert!(store.messages()[0].message.read);
        store.assert_invariant();
    }

    #[test]
    fn upsert_inserts_in_timestamp_order() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10), msg("c", 30)]);

        assert!(store.upsert_incoming(msg("b", 20)));

        assert_eq!(ids(&store), vec!["a", "b", "c"]);
        store.assert_invariant();
    }

    #[test]
    fn optimistic_confirm_replaces_without_growing() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10)]);
        let before = store.len();

        store.add_optimistic(msg("temp-1", 40));
        assert_eq!(store.len(), before + 1);

        assert!(store.resolve_optimistic("temp-1", Some(msg("real-9", 40))));

        assert_eq!(store.len(), before + 1);
        assert!(store.contains("real-9"));
        assert!(!store.contains("temp-1"));
        assert!(store
            .messages()
            .iter()
            .all(|e| e.delivery == Delivery::Confirmed));
        store.assert_invariant();
    }

    #[test]
    fn optimistic_failure_restores_the_previous_list() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10), msg("b", 20)]);
        let snapshot: Vec<MessageEntry> = store.messages().to_vec();

        store.add_optimistic(msg("temp-2", 40));
        assert!(store.resolve_optimistic("temp-2", None));

        assert_eq!(store.messages(), snapshot.as_slice());
        store.assert_invariant();
    }

    #[test]
    fn resolve_of_unknown_temp_id_is_a_noop() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10)]);
        assert!(!store.resolve_optimistic("temp-missing", None));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn echo_before_send_response_converges_to_one_entry() {
        // Realtime push of the confirmed message lands before the REST send
        // response resolves the optimistic entry.
        let mut store = MessageStore::new();
        store.add_optimistic(msg("temp-3", 40));

        store.upsert_incoming(msg("real-3", 40));
        assert_eq!(store.len(), 2);

        store.resolve_optimistic("temp-3", Some(msg("real-3", 40)));

        assert_eq!(store.len(), 1);
        assert_eq!(ids(&store), vec!["real-3"]);
        store.assert_invariant();
    }

    #[test]
    fn send_response_before_echo_converges_to_one_entry() {
        // The opposite arrival order of the previous test.
        let mut store = MessageStore::new();
        store.add_optimistic(msg("temp-4", 40));

        store.resolve_optimistic("temp-4", Some(msg("real-4", 40)));
        store.upsert_incoming(msg("real-4", 40));

        assert_eq!(store.len(), 1);
        assert_eq!(ids(&store), vec!["real-4"]);
        store.assert_invariant();
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10)]);
        store.upsert_incoming(msg("b", 10));
        store.upsert_incoming(msg("c", 10));

        assert_eq!(ids(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn invariant_holds_under_mixed_operation_sequences() {
        let mut store = MessageStore::new();
        store.seed(vec![msg("a", 10), msg("b", 20)]);
        store.upsert_incoming(msg("d", 40));
        store.prepend_older(vec![msg("old-1", 1), msg("old-2", 2)]);
        store.add_optimistic(msg("temp-5", 50));
        store.upsert_incoming(msg("c", 30));
        store.resolve_optimistic("temp-5", Some(msg("e", 50)));
        store.prepend_older(vec![msg("old-1", 1)]);

        assert_eq!(
            ids(&store),
            vec!["old-1", "old-2", "a", "b", "c", "d", "e"]
        );
        store.assert_invariant();
    }

    #[test]
    fn oldest_created_at_tracks_the_head() {
        let mut store = MessageStore::new();
        assert!(store.oldest_created_at().is_none());

        store.seed(vec![msg("a", 10), msg("b", 20)]);
        assert_eq!(
            store.oldest_created_at(),
            Some(Utc.timestamp_opt(10, 0).unwrap())
        );

        store.prepend_older(vec![msg("c", 5)]);
        assert_eq!(
            store.oldest_created_at(),
            Some(Utc.timestamp_opt(5, 0).unwrap())
        );
    }

    #[test]
    fn temp_ids_are_disjoint_from_server_ids() {
        let id = temp_message_id();
        assert!(id.starts_with("temp-"));
        assert_ne!(id, temp_message_id());
    }
}
