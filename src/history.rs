// Backlog loading for one conversation.

use log::{debug, info};
use std::sync::Arc;

use crate::api::ChatApi;
use crate::error::HistoryError;
use crate::models::{ConversationKey, Message};

/// Fetches the ordered message history for a conversation key. No caching:
/// every key switch triggers a fresh fetch.
pub struct HistoryLoader {
    api: Arc<dyn ChatApi>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        HistoryLoader { api }
    }

    /// Fetch the backlog. An Ok with an empty Vec is a genuinely empty
    /// conversation; a failed load is an Err, never an empty list.
    pub async fn load(&self, key: &ConversationKey) -> Result<Vec<Message>, HistoryError> {
        debug!(
            "Loading history with {} for property {}",
            key.remote_user_id, key.property_id
        );
        let messages = self
            .api
            .fetch_messages(&key.remote_user_id, &key.property_id)
            .await?;
        info!(
            "Loaded {} messages for conversation with {}",
            messages.len(),
            key.remote_user_id
        );
        Ok(messages)
    }
}
