// Typed wire frames for the realtime channel.
//
// The backend tags frames with a string event name; here that becomes a
// serde-tagged enum per direction, so dispatch and subscription are keyed by
// variant instead of loosely-typed event-name strings.

use serde::{Deserialize, Serialize};

use crate::models::{DeliveryState, Message};

/// Party reference as it appears on the wire: either a populated object or a
/// bare id string, depending on which backend path produced the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PartyRef {
    Object { id: String },
    Id(String),
}

impl PartyRef {
    pub fn id(&self) -> &str {
        match self {
            PartyRef::Object { id } => id,
            PartyRef::Id(id) => id,
        }
    }
}

/// Payload of an inbound `newMessage` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub sender: PartyRef,
    pub recipient: PartyRef,
    pub property: PartyRef,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl MessageEvent {
    /// Flatten the wire shape into a confirmed Message.
    pub fn to_message(&self) -> Message {
        Message {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            sender_id: self.sender.id().to_string(),
            recipient_id: self.recipient.id().to_string(),
            property_id: self.property.id().to_string(),
            content: self.content.clone(),
            created_at: self.created_at,
            delivery_state: DeliveryState::Confirmed,
        }
    }
}

/// Outbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientFrame {
    /// Sent after every (re)connect; the backend does not preserve
    /// per-connection identity across reconnects.
    #[serde(rename = "authenticate")]
    Authenticate {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Authenticate { .. } => "authenticate",
        }
    }
}

/// Inbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerFrame {
    #[serde(rename = "newMessage")]
    NewMessage(MessageEvent),
}

impl ServerFrame {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerFrame::NewMessage(_) => EventKind::NewMessage,
        }
    }
}

/// Subscription key: one variant per inbound application event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
}
