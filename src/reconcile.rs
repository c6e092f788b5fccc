// Message-list reconciliation.
//
// One ordered, duplicate-free list per active conversation, merged from
// three independent sources: the history fetch, live push events, and local
// optimistic sends. A push echo of a just-sent message can arrive before or
// after the send response; dedup runs by server id first, then by the
// client correlation id, and only then by the legacy content/time-window
// heuristic for peers that echo neither id.
//
// Every mutation checks the conversation generation so a response that
// arrives after the user switched conversations is dropped instead of
// leaking into the new list.

use log::debug;

use crate::connection::MessageEvent;
use crate::models::{ConversationKey, DeliveryState, Message};

/// Two entries with identical content closer together than this are treated
/// as one message. Fallback only; correlated entries never reach it.
pub const DEDUP_WINDOW_MS: i64 = 1000;

#[derive(Default)]
pub struct Reconciler {
    key: Option<ConversationKey>,
    generation: u64,
    messages: Vec<Message>,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler::default()
    }

    pub fn key(&self) -> Option<&ConversationKey> {
        self.key.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Switch to a conversation. The previous list is discarded wholesale;
    /// the returned generation stamps async completions started for it.
    pub fn activate(&mut self, key: ConversationKey) -> u64 {
        self.key = Some(key);
        self.messages.clear();
        self.generation += 1;
        self.generation
    }

    /// Replace the list with a fetched backlog. Ignored when the fetch was
    /// started for a conversation that is no longer active.
    pub fn seed(&mut self, generation: u64, mut messages: Vec<Message>) -> bool {
        if generation != self.generation {
            debug!(
                "Dropping history for stale generation {} (current {})",
                generation, self.generation
            );
            return false;
        }
        messages.sort_by_key(|m| m.created_at);
        self.messages = messages;
        true
    }

    /// Incorporate a pushed event. Events for other conversations are
    /// dropped; duplicates are absorbed silently.
    pub fn apply_event(&mut self, event: &MessageEvent) -> bool {
        let Some(key) = &self.key else {
            return false;
        };

        // Conversation isolation: the property must match and the remote
        // party must appear as sender or recipient.
        if event.property.id() != key.property_id {
            return false;
        }
        if event.sender.id() != key.remote_user_id && event.recipient.id() != key.remote_user_id {
            return false;
        }

        self.insert(event.to_message())
    }

    /// Insert a message in `created_at` order, or merge it into an existing
    /// duplicate. Returns whether the list grew.
    pub fn insert(&mut self, message: Message) -> bool {
        if let Some(index) = self.duplicate_of(&message) {
            let existing = &mut self.messages[index];
            debug!(
                "Duplicate message absorbed (existing id {:?}, incoming id {:?})",
                existing.id, message.id
            );
            // Keep the entry but upgrade it with anything authoritative the
            // duplicate carries.
            if existing.id.is_none() {
                existing.id = message.id;
            }
            if existing.client_id.is_none() {
                existing.client_id = message.client_id;
            }
            if message.delivery_state == DeliveryState::Confirmed {
                existing.delivery_state = DeliveryState::Confirmed;
            }
            return false;
        }

        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
        true
    }

    /// Replace the pending placeholder with the authoritative entry from the
    /// send response. A push echo that landed first is merged, not doubled.
    pub fn confirm(&mut self, generation: u64, client_id: &str, mut confirmed: Message) -> bool {
        if generation != self.generation {
            debug!("Dropping send confirmation for stale generation {}", generation);
            return false;
        }

        confirmed.delivery_state = DeliveryState::Confirmed;
        if confirmed.client_id.is_none() {
            confirmed.client_id = Some(client_id.to_string());
        }

        if let Some(index) = self
            .messages
            .iter()
            .position(|m| m.client_id.as_deref() == Some(client_id))
        {
            self.messages.remove(index);
        }
        self.insert(confirmed);
        true
    }

    /// Roll back a failed optimistic send. Returns the removed entry so the
    /// caller can hand the draft text back to the input field.
    pub fn remove_pending(&mut self, generation: u64, client_id: &str) -> Option<Message> {
        if generation != self.generation {
            return None;
        }
        let index = self.messages.iter().position(|m| {
            m.client_id.as_deref() == Some(client_id)
                && m.delivery_state == DeliveryState::Pending
        })?;
        Some(self.messages.remove(index))
    }

    fn duplicate_of(&self, message: &Message) -> Option<usize> {
        if let Some(id) = message.id.as_deref() {
            if let Some(index) = self
                .messages
                .iter()
                .position(|m| m.id.as_deref() == Some(id))
            {
                return Some(index);
            }
        }

        if let Some(client_id) = message.client_id.as_deref() {
            if let Some(index) = self
                .messages
                .iter()
                .position(|m| m.client_id.as_deref() == Some(client_id))
            {
                return Some(index);
            }
        }

        // Legacy fallback: a server echo of a just-sent message while the
        // pre-id optimistic entry is still in the list.
        self.messages.iter().position(|m| {
            m.content == message.content
                && (m.created_at - message.created_at).abs() < DEDUP_WINDOW_MS
        })
    }
}
