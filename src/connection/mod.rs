// Connection management for the realtime chat channel.
//
// One ConnectionManager per process: it owns the single persistent link to
// the messaging backend, re-authenticates after every reconnect, and fans
// inbound events out to typed subscribers. Construct it once and pass it by
// reference; it is created on first chat screen mount and torn down only on
// logout, not on screen unmount.

pub mod events;
pub mod transport;

pub use events::{ClientFrame, EventKind, MessageEvent, PartyRef, ServerFrame};
pub use transport::{Transport, TransportLink, WebSocketTransport};

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;

use crate::error::ConnectionError;
use crate::session;

/// Connection lifecycle state, observable through [`ConnectionManager::state_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
    Failed,
}

/// Bounds for the automatic reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

pub type SubscriptionId = u64;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

#[derive(Default)]
struct Registry {
    next_id: SubscriptionId,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, mpsc::Sender<ServerFrame>)>>,
}

struct Inner {
    driver: Option<JoinHandle<()>>,
    /// Identity the running driver authenticates as.
    user_id: Option<String>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    registry: Arc<TokioMutex<Registry>>,
    outbound: Arc<TokioMutex<Option<mpsc::Sender<String>>>>,
    retry_notify: Arc<Notify>,
    inner: TokioMutex<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_policy(transport, ReconnectPolicy::default())
    }

    pub fn with_policy(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            transport,
            policy,
            state_tx: Arc::new(state_tx),
            registry: Arc::new(TokioMutex::new(Registry::default())),
            outbound: Arc::new(TokioMutex::new(None)),
            retry_notify: Arc::new(Notify::new()),
            inner: TokioMutex::new(Inner {
                driver: None,
                user_id: None,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions (connect, disconnect, reconnect, failure).
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Bring the connection up and authenticate. No-op when already up.
    ///
    /// When `user_id` is omitted it is derived from the stored session;
    /// without a stored session this fails with `ConnectionError::NoSession`
    /// before any network I/O. Returns once the connection is authenticated,
    /// or with `RetriesExhausted` when the attempt cap is hit. Switching
    /// identity requires an explicit `disconnect()` first; a connect under a
    /// different id while the driver runs keeps the current identity.
    pub async fn connect(&self, user_id: Option<&str>) -> Result<(), ConnectionError> {
        let user_id = match user_id {
            Some(id) => id.to_string(),
            None => session::load_session()
                .ok()
                .flatten()
                .map(|s| s.user_id)
                .ok_or(ConnectionError::NoSession)?,
        };

        {
            let mut inner = self.inner.lock().await;
            if let Some(driver) = &inner.driver {
                if driver.is_finished() {
                    inner.driver = None;
                    inner.user_id = None;
                }
            }

            if inner.driver.is_some() {
                if inner.user_id.as_deref() != Some(user_id.as_str()) {
                    warn!(
                        "connect() as {} while already running as {:?}; keeping the current identity",
                        user_id, inner.user_id
                    );
                }
                if self.state() == ConnectionState::Failed {
                    // Wake the parked driver for another bounded round.
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                    self.retry_notify.notify_one();
                } else {
                    debug!("connect() while connection is {:?}; nothing to do", self.state());
                }
            } else {
                let driver = tokio::spawn(drive(
                    self.transport.clone(),
                    self.policy.clone(),
                    self.state_tx.clone(),
                    self.registry.clone(),
                    self.outbound.clone(),
                    self.retry_notify.clone(),
                    user_id.clone(),
                ));
                inner.driver = Some(driver);
                inner.user_id = Some(user_id);
            }
        }

        self.await_authenticated().await
    }

    /// Tear the connection down and drop every subscription. Idempotent.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
        inner.user_id = None;
        *self.outbound.lock().await = None;
        self.registry.lock().await.subscribers.clear();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Disconnected from messaging backend");
    }

    /// Manual retry after the automatic reconnect cap was exhausted.
    pub fn retry(&self) {
        if self.state() == ConnectionState::Failed {
            info!("Manual retry requested");
            self.state_tx.send_replace(ConnectionState::Reconnecting);
            self.retry_notify.notify_one();
        } else {
            debug!("retry() while connection is {:?}; ignoring", self.state());
        }
    }

    /// Register for inbound events of one kind. Every subscriber of a kind
    /// receives every event of that kind.
    pub async fn subscribe(
        &self,
        kind: EventKind,
    ) -> (SubscriptionId, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut registry = self.registry.lock().await;
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.entry(kind).or_default().push((id, tx));
        (id, rx)
    }

    pub async fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        let mut registry = self.registry.lock().await;
        if let Some(entries) = registry.subscribers.get_mut(&kind) {
            entries.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    pub async fn unsubscribe_all(&self, kind: EventKind) {
        self.registry.lock().await.subscribers.remove(&kind);
    }

    /// Send an outbound frame. Dropped with a warning when not connected;
    /// callers get no delivery guarantee either way.
    pub async fn emit(&self, frame: ClientFrame) {
        let sender = { self.outbound.lock().await.clone() };
        let Some(sender) = sender else {
            warn!("emit({}) while disconnected; dropping frame", frame.name());
            return;
        };
        match serde_json::to_string(&frame) {
            Ok(text) => {
                if sender.send(text).await.is_err() {
                    warn!("emit({}) failed: link closed", frame.name());
                }
            }
            Err(e) => warn!("Failed to encode {} frame: {}", frame.name(), e),
        }
    }

    async fn await_authenticated(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Authenticated => return Ok(()),
                ConnectionState::Failed => return Err(ConnectionError::RetriesExhausted),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closed);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.inner.get_mut().driver.take() {
            driver.abort();
        }
    }
}

/// Background task owning the link: connect, authenticate, pump inbound
/// frames, reconnect with bounded backoff, park in Failed until retried.
async fn drive(
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    registry: Arc<TokioMutex<Registry>>,
    outbound: Arc<TokioMutex<Option<mpsc::Sender<String>>>>,
    retry_notify: Arc<Notify>,
    user_id: String,
) {
    let mut attempts: u32 = 0;
    loop {
        state.send_replace(if attempts == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        match transport.open().await {
            Ok(link) => {
                state.send_replace(ConnectionState::Connected);

                // The backend does not preserve per-connection identity
                // across reconnects, so authenticate on every link-up.
                let auth = ClientFrame::Authenticate {
                    user_id: user_id.clone(),
                };
                let encoded = match serde_json::to_string(&auth) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode authenticate frame: {}", e);
                        String::new()
                    }
                };
                if encoded.is_empty() || link.outbound.send(encoded).await.is_err() {
                    warn!("Link dropped before authentication completed");
                } else {
                    attempts = 0;
                    state.send_replace(ConnectionState::Authenticated);
                    info!("Connected and authenticated as {}", user_id);
                    *outbound.lock().await = Some(link.outbound.clone());

                    let mut inbound = link.inbound;
                    while let Some(text) = inbound.recv().await {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => dispatch(&registry, frame).await,
                            Err(e) => warn!("Ignoring malformed inbound frame: {}", e),
                        }
                    }

                    warn!("Connection to messaging backend lost");
                    *outbound.lock().await = None;
                }
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
            }
        }

        attempts += 1;
        if attempts > policy.max_attempts {
            error!(
                "Giving up after {} reconnect attempts; waiting for manual retry",
                policy.max_attempts
            );
            state.send_replace(ConnectionState::Failed);
            retry_notify.notified().await;
            attempts = 0;
            continue;
        }

        let delay = backoff_delay(&policy, attempts);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, attempts, policy.max_attempts
        );
        tokio::time::sleep(delay).await;
    }
}

fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exponential = policy
        .min_delay
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exponential.clamp(policy.min_delay, policy.max_delay)
}

async fn dispatch(registry: &TokioMutex<Registry>, frame: ServerFrame) {
    let kind = frame.kind();
    let mut registry = registry.lock().await;
    let Some(entries) = registry.subscribers.get_mut(&kind) else {
        debug!("No subscribers for {:?} event", kind);
        return;
    };
    // Fan out to every subscriber; prune the ones whose receiver is gone.
    entries.retain(|(id, tx)| match tx.try_send(frame.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Subscriber {} is lagging; dropping event", id);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    });
}
