// Optimistic send with rollback.
//
// Per attempt: a pending entry goes into the list immediately, the
// persistence call runs, and the result either confirms the entry or rolls
// it back and hands the draft text back to the caller. Rapid double-taps
// are not deduplicated; each carries its own correlation id and becomes its
// own message.

use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use crate::api::{ChatApi, SendRequest};
use crate::error::SendError;
use crate::models::{ConversationKey, DeliveryState, Message};
use crate::reconcile::Reconciler;

pub struct SendCoordinator {
    api: Arc<dyn ChatApi>,
    reconciler: Arc<TokioMutex<Reconciler>>,
}

impl SendCoordinator {
    pub fn new(api: Arc<dyn ChatApi>, reconciler: Arc<TokioMutex<Reconciler>>) -> Self {
        SendCoordinator { api, reconciler }
    }

    /// Send one message. The caller clears its input field before awaiting
    /// this; on failure the original content comes back in the error so it
    /// can be restored for a manual retry.
    pub async fn send(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<Message, SendError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SendError::EmptyContent);
        }

        let client_id = Uuid::new_v4().to_string();
        let pending = Message {
            id: None,
            client_id: Some(client_id.clone()),
            sender_id: key.local_user_id.clone(),
            recipient_id: key.remote_user_id.clone(),
            property_id: key.property_id.clone(),
            content: trimmed.to_string(),
            created_at: Utc::now().timestamp_millis(),
            delivery_state: DeliveryState::Pending,
        };

        // Optimistic insert, stamped with the generation so a completion
        // arriving after a conversation switch cannot touch the new list.
        // When the active key already changed the send proceeds without
        // touching the list at all, now or on completion.
        let generation = {
            let mut reconciler = self.reconciler.lock().await;
            if reconciler.key() == Some(key) {
                reconciler.insert(pending.clone());
                Some(reconciler.generation())
            } else {
                debug!("Conversation switched before the send started; list untouched");
                None
            }
        };

        let request = SendRequest {
            recipient_id: key.remote_user_id.clone(),
            property_id: key.property_id.clone(),
            content: trimmed.to_string(),
            client_id: Some(client_id.clone()),
        };

        match self.api.send_message(request).await {
            Ok(confirmed) => {
                debug!(
                    "Send confirmed, server id {:?} for correlation id {}",
                    confirmed.id, client_id
                );
                if let Some(generation) = generation {
                    let mut reconciler = self.reconciler.lock().await;
                    reconciler.confirm(generation, &client_id, confirmed.clone());
                }
                Ok(confirmed)
            }
            Err(reason) => {
                warn!("Send failed, rolling back optimistic entry: {}", reason);
                if let Some(generation) = generation {
                    let mut reconciler = self.reconciler.lock().await;
                    reconciler.remove_pending(generation, &client_id);
                }
                Err(SendError::Rejected {
                    draft: trimmed.to_string(),
                    reason,
                })
            }
        }
    }
}
