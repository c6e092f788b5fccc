// Glue for one open conversation view: the shared reconciler, the history
// loader and send coordinator over one API client, plus a pump task that
// drains the realtime subscription into the reconciler.

use log::debug;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use crate::api::ChatApi;
use crate::connection::{ConnectionManager, EventKind, ServerFrame, SubscriptionId};
use crate::error::{HistoryError, SendError};
use crate::history::HistoryLoader;
use crate::models::{ConversationKey, Message};
use crate::reconcile::Reconciler;
use crate::send::SendCoordinator;

pub struct Conversation {
    connection: Arc<ConnectionManager>,
    reconciler: Arc<TokioMutex<Reconciler>>,
    history: HistoryLoader,
    sender: SendCoordinator,
    subscription: Option<(SubscriptionId, JoinHandle<()>)>,
}

impl Conversation {
    pub fn new(connection: Arc<ConnectionManager>, api: Arc<dyn ChatApi>) -> Self {
        let reconciler = Arc::new(TokioMutex::new(Reconciler::new()));
        Conversation {
            connection,
            history: HistoryLoader::new(api.clone()),
            sender: SendCoordinator::new(api, reconciler.clone()),
            reconciler,
            subscription: None,
        }
    }

    /// Open (or switch to) a conversation: discard the previous list, hook
    /// a fresh realtime subscription up, and seed from history.
    pub async fn open(&mut self, key: ConversationKey) -> Result<(), HistoryError> {
        let generation = self.reconciler.lock().await.activate(key.clone());

        // Resubscribe on every open. A disconnect on the manager side clears
        // the registry and ends the old pump, so a kept subscription could be
        // dead without any local signal.
        if let Some((id, pump)) = self.subscription.take() {
            self.connection.unsubscribe(EventKind::NewMessage, id).await;
            pump.abort();
        }
        let (id, mut events) = self.connection.subscribe(EventKind::NewMessage).await;
        let reconciler = self.reconciler.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = events.recv().await {
                let ServerFrame::NewMessage(event) = frame;
                reconciler.lock().await.apply_event(&event);
            }
        });
        self.subscription = Some((id, pump));

        let messages = self.history.load(&key).await?;
        let mut reconciler = self.reconciler.lock().await;
        if !reconciler.seed(generation, messages) {
            debug!("History arrived for an abandoned conversation; ignored");
        }
        Ok(())
    }

    pub async fn send(&self, content: &str) -> Result<Message, SendError> {
        let key = self
            .reconciler
            .lock()
            .await
            .key()
            .cloned()
            .ok_or(SendError::NoConversation)?;
        self.sender.send(&key, content).await
    }

    /// Snapshot of the reconciled, ordered message list.
    pub async fn messages(&self) -> Vec<Message> {
        self.reconciler.lock().await.messages().to_vec()
    }

    /// Drop the realtime subscription. The connection itself stays up for
    /// other screens.
    pub async fn close(&mut self) {
        if let Some((id, pump)) = self.subscription.take() {
            self.connection.unsubscribe(EventKind::NewMessage, id).await;
            pump.abort();
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if let Some((_, pump)) = self.subscription.take() {
            pump.abort();
        }
    }
}
