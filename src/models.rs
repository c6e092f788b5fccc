// Core data model for the chat layer: conversation identity and messages.

use serde::{Deserialize, Serialize};

/// Identity of one chat thread: the local user talking to a remote party
/// about one property listing. All message operations are scoped to a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub local_user_id: String,
    pub remote_user_id: String,
    pub property_id: String,
}

impl ConversationKey {
    pub fn new(local_user_id: &str, remote_user_id: &str, property_id: &str) -> Self {
        ConversationKey {
            local_user_id: local_user_id.to_string(),
            remote_user_id: remote_user_id.to_string(),
            property_id: property_id.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryState {
    Pending,   // Optimistic local entry, persistence call in flight
    Confirmed, // Acknowledged by the server (or arrived from the server)
    Failed,    // Persistence call failed; entry is rolled back
}

#[derive(Debug, Clone)]
pub struct Message {
    /// Server-assigned id. Absent while a local send awaits confirmation.
    pub id: Option<String>,
    /// Client-generated correlation id attached to optimistic sends so the
    /// server echo can be matched without content heuristics.
    pub client_id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub property_id: String,
    pub content: String,
    /// Milliseconds since the Unix epoch. Server-assigned for confirmed
    /// entries, client-generated for optimistic ones.
    pub created_at: i64,
    pub delivery_state: DeliveryState,
}

impl Message {
    pub fn is_confirmed(&self) -> bool {
        self.delivery_state == DeliveryState::Confirmed
    }

    /// True when this message belongs to the given conversation: the property
    /// matches and the remote party appears as sender or recipient.
    pub fn belongs_to(&self, key: &ConversationKey) -> bool {
        self.property_id == key.property_id
            && (self.sender_id == key.remote_user_id || self.recipient_id == key.remote_user_id)
    }
}
