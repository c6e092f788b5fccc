// Realtime chat delivery and reconciliation layer for the rental-marketplace
// client. Screens and navigation live in the host app; this crate owns the
// persistent connection, history loading, optimistic sends, and the merge of
// all three message sources into one ordered, duplicate-free list.

pub mod api;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod history;
pub mod logging;
pub mod models;
pub mod reconcile;
pub mod send;
pub mod session;

// Re-export the main types for convenience
pub use api::{ChatApi, HttpChatApi, SendRequest};
pub use connection::{
    ClientFrame, ConnectionManager, ConnectionState, EventKind, MessageEvent, PartyRef,
    ReconnectPolicy, ServerFrame, Transport, TransportLink, WebSocketTransport,
};
pub use conversation::Conversation;
pub use error::{ApiError, ConnectionError, HistoryError, SendError};
pub use history::HistoryLoader;
pub use models::{ConversationKey, DeliveryState, Message};
pub use reconcile::{Reconciler, DEDUP_WINDOW_MS};
pub use send::SendCoordinator;
