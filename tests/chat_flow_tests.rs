// End-to-end chat flow tests over an in-memory transport and a scripted API:
// connect/authenticate, push delivery, reconnection convergence, optimistic
// send with rollback, and conversation isolation.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::timeout;

use staychat::{
    ApiError, ChatApi, ClientFrame, ConnectionError, ConnectionManager, ConnectionState,
    Conversation, ConversationKey, DeliveryState, EventKind, Message, Reconciler,
    ReconnectPolicy, SendCoordinator, SendError, SendRequest, ServerFrame, Transport,
    TransportLink,
};

const WAIT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

//------------------------------------------------------------------------------
// Test doubles
//------------------------------------------------------------------------------

/// Transport handing out pre-scripted links; open() fails once the script
/// runs out, which is how tests simulate an unreachable backend.
struct ScriptedTransport {
    links: Arc<TokioMutex<VecDeque<TransportLink>>>,
}

impl ScriptedTransport {
    fn new() -> (Self, Arc<TokioMutex<VecDeque<TransportLink>>>) {
        init_logging();
        let links = Arc::new(TokioMutex::new(VecDeque::new()));
        (
            ScriptedTransport {
                links: links.clone(),
            },
            links,
        )
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> std::result::Result<TransportLink, ConnectionError> {
        self.links
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ConnectionError::Transport("backend unreachable".to_string()))
    }
}

/// Server-side handles for one scripted link.
struct LinkHandle {
    /// Frames the client sent to the server.
    from_client: mpsc::Receiver<String>,
    /// Feed for frames the server pushes to the client. Dropping this
    /// simulates a connection drop.
    to_client: Option<mpsc::Sender<String>>,
}

fn scripted_link() -> (TransportLink, LinkHandle) {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    (
        TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        },
        LinkHandle {
            from_client: out_rx,
            to_client: Some(in_tx),
        },
    )
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        min_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts,
    }
}

struct MockApi {
    history: TokioMutex<VecDeque<std::result::Result<Vec<Message>, ApiError>>>,
    sends: TokioMutex<VecDeque<std::result::Result<Message, ApiError>>>,
    requests: TokioMutex<Vec<SendRequest>>,
}

impl MockApi {
    fn new() -> Self {
        MockApi {
            history: TokioMutex::new(VecDeque::new()),
            sends: TokioMutex::new(VecDeque::new()),
            requests: TokioMutex::new(Vec::new()),
        }
    }

    async fn script_history(&self, result: std::result::Result<Vec<Message>, ApiError>) {
        self.history.lock().await.push_back(result);
    }

    async fn script_send(&self, result: std::result::Result<Message, ApiError>) {
        self.sends.lock().await.push_back(result);
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_messages(
        &self,
        _remote_user_id: &str,
        _property_id: &str,
    ) -> std::result::Result<Vec<Message>, ApiError> {
        self.history
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_message(
        &self,
        request: SendRequest,
    ) -> std::result::Result<Message, ApiError> {
        let scripted = self
            .sends
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(ApiError::Rejected));
        let result = match scripted {
            // The real backend echoes the correlation id back
            Ok(mut message) => {
                message.client_id = request.client_id.clone();
                Ok(message)
            }
            Err(e) => Err(e),
        };
        self.requests.lock().await.push(request);
        result
    }
}

fn confirmed(id: &str, sender: &str, recipient: &str, content: &str, created_at: i64) -> Message {
    Message {
        id: Some(id.to_string()),
        client_id: None,
        sender_id: sender.to_string(),
        recipient_id: recipient.to_string(),
        property_id: "prop1".to_string(),
        content: content.to_string(),
        created_at,
        delivery_state: DeliveryState::Confirmed,
    }
}

fn push_frame(id: &str, content: &str, created_at: i64) -> String {
    format!(
        r#"{{"event":"newMessage","payload":{{"sender":{{"id":"owner1"}},"recipient":"guest1","property":{{"id":"prop1"}},"content":"{}","createdAt":{},"id":"{}"}}}}"#,
        content, created_at, id
    )
}

async fn expect_authenticate(handle: &mut LinkHandle, user_id: &str) {
    let frame = timeout(WAIT, handle.from_client.recv())
        .await
        .expect("timed out waiting for authenticate frame")
        .expect("link closed before authenticate");
    let parsed: ClientFrame = serde_json::from_str(&frame).expect("unparseable client frame");
    let ClientFrame::Authenticate { user_id: sent } = parsed;
    assert_eq!(sent, user_id);
}

async fn wait_for_messages(conversation: &Conversation, len: usize) -> Vec<Message> {
    for _ in 0..200 {
        let messages = conversation.messages().await;
        if messages.len() == len {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "message list never reached length {} (got {})",
        len,
        conversation.messages().await.len()
    );
}

//------------------------------------------------------------------------------
// Connection lifecycle
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_authenticates_and_delivers_events() -> Result<()> {
    let (transport, links) = ScriptedTransport::new();
    let (link, mut handle) = scripted_link();
    links.lock().await.push_back(link);

    let manager = ConnectionManager::with_policy(Arc::new(transport), fast_policy(3));
    manager.connect(Some("guest1")).await?;
    assert_eq!(manager.state(), ConnectionState::Authenticated);
    expect_authenticate(&mut handle, "guest1").await;

    let (_, mut events) = manager.subscribe(EventKind::NewMessage).await;
    let feed = handle.to_client.as_ref().unwrap();
    feed.send(push_frame("m1", "hi", 1000)).await?;

    let frame = timeout(WAIT, events.recv()).await?.expect("no event");
    let ServerFrame::NewMessage(event) = frame;
    assert_eq!(event.id.as_deref(), Some("m1"));
    assert_eq!(event.content, "hi");

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    // disconnect is idempotent
    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_reauthenticates_and_converges() -> Result<()> {
    let (transport, links) = ScriptedTransport::new();
    let (first_link, mut first) = scripted_link();
    let (second_link, mut second) = scripted_link();
    {
        let mut queue = links.lock().await;
        queue.push_back(first_link);
        queue.push_back(second_link);
    }

    let manager = Arc::new(ConnectionManager::with_policy(
        Arc::new(transport),
        fast_policy(3),
    ));
    manager.connect(Some("guest1")).await?;
    expect_authenticate(&mut first, "guest1").await;

    let (_, mut events) = manager.subscribe(EventKind::NewMessage).await;
    first
        .to_client
        .as_ref()
        .unwrap()
        .send(push_frame("m1", "before the drop", 1000))
        .await?;
    let frame = timeout(WAIT, events.recv()).await?.expect("no event");
    let ServerFrame::NewMessage(event) = frame;
    assert_eq!(event.id.as_deref(), Some("m1"));

    // Drop the link; the driver must reconnect and re-send authenticate,
    // since the backend forgets per-connection identity.
    first.to_client.take();
    expect_authenticate(&mut second, "guest1").await;

    let mut states = manager.state_changes();
    timeout(WAIT, async {
        loop {
            if *states.borrow_and_update() == ConnectionState::Authenticated {
                break;
            }
            states.changed().await.expect("state channel closed");
        }
    })
    .await?;

    second
        .to_client
        .as_ref()
        .unwrap()
        .send(push_frame("m2", "after the drop", 2000))
        .await?;
    let frame = timeout(WAIT, events.recv()).await?.expect("no event");
    let ServerFrame::NewMessage(event) = frame;
    assert_eq!(event.id.as_deref(), Some("m2"));

    // Each event was delivered exactly once
    assert!(timeout(Duration::from_millis(100), events.recv())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_retry_after_attempt_cap() -> Result<()> {
    let (transport, links) = ScriptedTransport::new();

    let manager = Arc::new(ConnectionManager::with_policy(
        Arc::new(transport),
        fast_policy(1),
    ));

    // No links scripted: the bounded retry loop must give up.
    let result = manager.connect(Some("guest1")).await;
    assert!(matches!(result, Err(ConnectionError::RetriesExhausted)));
    assert_eq!(manager.state(), ConnectionState::Failed);

    // Backend comes back; a manual retry recovers the connection.
    let (link, mut handle) = scripted_link();
    links.lock().await.push_back(link);
    manager.retry();

    let mut states = manager.state_changes();
    timeout(WAIT, async {
        loop {
            if *states.borrow_and_update() == ConnectionState::Authenticated {
                break;
            }
            states.changed().await.expect("state channel closed");
        }
    })
    .await?;
    expect_authenticate(&mut handle, "guest1").await;
    Ok(())
}

#[tokio::test]
async fn test_connect_with_different_identity_keeps_current_session() -> Result<()> {
    let (transport, links) = ScriptedTransport::new();
    let (link, mut handle) = scripted_link();
    links.lock().await.push_back(link);

    let manager = ConnectionManager::with_policy(Arc::new(transport), fast_policy(3));
    manager.connect(Some("guest1")).await?;
    expect_authenticate(&mut handle, "guest1").await;

    // A second connect under another identity is a warned no-op; the link
    // stays up under the original authentication and nothing is re-sent.
    manager.connect(Some("guest2")).await?;
    assert_eq!(manager.state(), ConnectionState::Authenticated);
    assert!(timeout(Duration::from_millis(100), handle.from_client.recv())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_emit_while_disconnected_is_a_silent_noop() {
    let (transport, _links) = ScriptedTransport::new();
    let manager = ConnectionManager::with_policy(Arc::new(transport), fast_policy(1));

    // Never connected; the frame is dropped with a warning, no panic.
    manager
        .emit(ClientFrame::Authenticate {
            user_id: "guest1".to_string(),
        })
        .await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

//------------------------------------------------------------------------------
// Conversation flow
//------------------------------------------------------------------------------

async fn connected_manager() -> (Arc<ConnectionManager>, LinkHandle) {
    let (transport, links) = ScriptedTransport::new();
    let (link, handle) = scripted_link();
    links.lock().await.push_back(link);
    let manager = Arc::new(ConnectionManager::with_policy(
        Arc::new(transport),
        fast_policy(3),
    ));
    manager
        .connect(Some("guest1"))
        .await
        .expect("connect failed");
    (manager, handle)
}

#[tokio::test]
async fn test_open_seeds_history_and_merges_push_events() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![confirmed("1", "owner1", "guest1", "hi", 1000)]))
        .await;

    let mut conversation = Conversation::new(manager, api);
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;
    assert_eq!(conversation.messages().await.len(), 1);

    // Push echo of the seeded message within the dedup window: absorbed
    handle
        .to_client
        .as_ref()
        .unwrap()
        .send(
            r#"{"event":"newMessage","payload":{"sender":{"id":"owner1"},"recipient":"guest1","property":{"id":"prop1"},"content":"hi","createdAt":1500}}"#
                .to_string(),
        )
        .await?;
    // A genuinely new message lands after it
    handle
        .to_client
        .as_ref()
        .unwrap()
        .send(push_frame("2", "yo", 2000))
        .await?;

    let messages = wait_for_messages(&conversation, 2).await;
    assert_eq!(messages[0].id.as_deref(), Some("1"));
    assert_eq!(messages[1].id.as_deref(), Some("2"));
    assert!(messages.iter().all(|m| m.is_confirmed()));

    conversation.close().await;
    Ok(())
}

#[tokio::test]
async fn test_push_for_other_conversation_is_ignored() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![])).await;

    let mut conversation = Conversation::new(manager, api);
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;

    // Same parties, different property: must never be inserted
    handle
        .to_client
        .as_ref()
        .unwrap()
        .send(
            r#"{"event":"newMessage","payload":{"sender":{"id":"owner1"},"recipient":"guest1","property":{"id":"prop2"},"content":"wrong listing","createdAt":1000,"id":"x1"}}"#
                .to_string(),
        )
        .await?;
    // Followed by one that does belong, to prove the pump is alive
    handle
        .to_client
        .as_ref()
        .unwrap()
        .send(push_frame("m1", "right listing", 2000))
        .await?;

    let messages = wait_for_messages(&conversation, 1).await;
    assert_eq!(messages[0].id.as_deref(), Some("m1"));
    Ok(())
}

#[tokio::test]
async fn test_send_success_confirms_optimistic_entry() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![])).await;
    let now = chrono::Utc::now().timestamp_millis();
    api.script_send(Ok(confirmed("srv1", "guest1", "owner1", "hello", now)))
        .await;

    let mut conversation = Conversation::new(manager, api.clone());
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;

    let sent = conversation.send("hello").await?;
    assert_eq!(sent.id.as_deref(), Some("srv1"));

    let messages = conversation.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("srv1"));
    assert!(messages[0].is_confirmed());

    // The persistence call carried the correlation id
    let requests = api.requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].client_id.is_some());
    Ok(())
}

#[tokio::test]
async fn test_send_failure_rolls_back_and_returns_draft() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![confirmed("1", "owner1", "guest1", "hi", 1000)]))
        .await;
    api.script_send(Err(ApiError::Rejected)).await;

    let mut conversation = Conversation::new(manager, api);
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;

    let result = conversation.send("did you get my booking?").await;
    match result {
        Err(SendError::Rejected { draft, .. }) => {
            assert_eq!(draft, "did you get my booking?");
        }
        other => panic!("expected Rejected, got {:?}", other.map(|m| m.id)),
    }

    // The list is exactly as it was before the send
    let messages = conversation.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("1"));
    Ok(())
}

#[tokio::test]
async fn test_send_rejects_blank_content() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![])).await;

    let mut conversation = Conversation::new(manager, api);
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;

    assert!(matches!(
        conversation.send("   ").await,
        Err(SendError::EmptyContent)
    ));
    assert!(conversation.messages().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_send_without_open_conversation() {
    let (manager, _handle) = connected_manager().await;
    let api = Arc::new(MockApi::new());
    let conversation = Conversation::new(manager, api);

    assert!(matches!(
        conversation.send("hello").await,
        Err(SendError::NoConversation)
    ));
}

#[tokio::test]
async fn test_history_error_is_distinct_from_empty() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Err(ApiError::Rejected)).await;
    api.script_history(Ok(vec![])).await;

    let mut conversation = Conversation::new(manager, api);

    // Load failure surfaces as an error, not as an empty conversation
    let failed = conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await;
    assert!(failed.is_err());

    // A genuinely empty conversation opens cleanly
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;
    assert!(conversation.messages().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_send_finishing_after_switch_stays_out_of_new_conversation() {
    init_logging();
    let api = Arc::new(MockApi::new());
    let now = chrono::Utc::now().timestamp_millis();
    api.script_send(Ok(confirmed("srv1", "guest1", "owner1", "hello from A", now)))
        .await;

    let reconciler = Arc::new(TokioMutex::new(Reconciler::new()));
    let coordinator = SendCoordinator::new(api, reconciler.clone());

    // The user switched to another conversation before the send ran.
    let abandoned = ConversationKey::new("guest1", "owner1", "propA");
    reconciler
        .lock()
        .await
        .activate(ConversationKey::new("guest1", "owner2", "propB"));

    let sent = coordinator
        .send(&abandoned, "hello from A")
        .await
        .expect("send should still persist");
    assert_eq!(sent.id.as_deref(), Some("srv1"));

    // The now-active conversation's list never sees the foreign message.
    assert!(reconciler.lock().await.messages().is_empty());
}

#[tokio::test]
async fn test_conversation_receives_events_after_reconnect_cycle() -> Result<()> {
    let (transport, links) = ScriptedTransport::new();
    let (first_link, mut first) = scripted_link();
    links.lock().await.push_back(first_link);

    let manager = Arc::new(ConnectionManager::with_policy(
        Arc::new(transport),
        fast_policy(3),
    ));
    manager.connect(Some("guest1")).await?;
    expect_authenticate(&mut first, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![])).await;
    api.script_history(Ok(vec![])).await;

    let mut conversation = Conversation::new(manager.clone(), api);
    let key = ConversationKey::new("guest1", "owner1", "prop1");
    conversation.open(key.clone()).await?;

    // Full logout/login cycle: the registry is cleared, which ends the
    // conversation's old event pump.
    manager.disconnect().await;
    let (second_link, mut second) = scripted_link();
    links.lock().await.push_back(second_link);
    manager.connect(Some("guest1")).await?;
    expect_authenticate(&mut second, "guest1").await;

    // Reopening hooks a fresh subscription up; pushes flow again.
    conversation.open(key).await?;
    second
        .to_client
        .as_ref()
        .unwrap()
        .send(push_frame("m1", "still alive", 1000))
        .await?;
    let messages = wait_for_messages(&conversation, 1).await;
    assert_eq!(messages[0].id.as_deref(), Some("m1"));

    conversation.close().await;
    Ok(())
}

#[tokio::test]
async fn test_switching_conversations_reloads_from_scratch() -> Result<()> {
    let (manager, mut handle) = connected_manager().await;
    expect_authenticate(&mut handle, "guest1").await;

    let api = Arc::new(MockApi::new());
    api.script_history(Ok(vec![confirmed("1", "owner1", "guest1", "hi", 1000)]))
        .await;
    api.script_history(Ok(vec![confirmed(
        "9",
        "owner2",
        "guest1",
        "another thread",
        5000,
    )]))
        .await;

    let mut conversation = Conversation::new(manager, api);
    conversation
        .open(ConversationKey::new("guest1", "owner1", "prop1"))
        .await?;
    assert_eq!(conversation.messages().await.len(), 1);

    conversation
        .open(ConversationKey::new("guest1", "owner2", "prop1"))
        .await?;
    let messages = conversation.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("9"));
    Ok(())
}
