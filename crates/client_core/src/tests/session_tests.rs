use super::*;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use shared::{
    domain::{MessageId, MessageStatus, Participant},
    error::{ApiError, ErrorCode},
    protocol::PresenceNotice,
};
use tokio::time::timeout;

use crate::transport::{Link, LinkPeer};

const ME: i64 = 7;
const DISPATCH: i64 = 3;

#[derive(Default)]
struct ScriptedConnector {
    script: std::sync::Mutex<VecDeque<Link>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    fn push_link(&self) -> LinkPeer {
        let (link, peer) = Link::pair();
        self.script.lock().expect("script lock").push_back(link);
        peer
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _credential: &str) -> Result<Link, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| ClientError::Transport("connection refused".into()))
    }
}

#[derive(Default)]
struct FakeApi {
    pages: std::sync::Mutex<HashMap<ConversationId, Vec<MessagePayload>>>,
    conversations: std::sync::Mutex<Vec<ConversationSummary>>,
    sent: std::sync::Mutex<Vec<SendMessageRequest>>,
    token: std::sync::Mutex<Option<String>>,
    failing_fetches: AtomicUsize,
    fetches: AtomicUsize,
    list_calls: AtomicUsize,
    reject_sends: AtomicBool,
}

impl FakeApi {
    fn set_page(&self, conversation_id: ConversationId, messages: Vec<MessagePayload>) {
        self.pages
            .lock()
            .expect("pages lock")
            .insert(conversation_id, messages);
    }

    fn sent(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().expect("sent lock").clone()
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

fn unavailable() -> ClientError {
    ClientError::Status {
        status: 503,
        error: ApiError::new(ErrorCode::Internal, "service unavailable"),
    }
}

#[async_trait::async_trait]
impl MessagingApi for FakeApi {
    async fn set_access_token(&self, token: Option<String>) {
        *self.token.lock().expect("token lock") = token;
    }

    async fn list_conversations(
        &self,
        _query: &ConversationListQuery,
    ) -> Result<Vec<ConversationSummary>, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.conversations.lock().expect("conversations lock").clone())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        _page: &MessagePageQuery,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(unavailable());
        }
        Ok(self
            .pages
            .lock()
            .expect("pages lock")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_conversation(
        &self,
        participant_id: &UserId,
    ) -> Result<ConversationSummary, ClientError> {
        Ok(summary(900, participant_id.clone(), 0))
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<(), ClientError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.sent.lock().expect("sent lock").push(request.clone());
        Ok(())
    }
}

fn conv() -> ConversationId {
    ConversationId::from(42)
}

fn other_conv() -> ConversationId {
    ConversationId::from(77)
}

fn identity() -> Identity {
    Identity {
        user_id: UserId::from(ME),
        access_token: "jwt-driver".into(),
    }
}

fn msg(conversation_id: ConversationId, id: i64, sender: i64, minute: u32) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        conversation_id,
        sender_id: UserId::from(sender),
        recipient_id: None,
        content: format!("message {id}"),
        kind: MessageKind::Text,
        status: Some(MessageStatus::Sent),
        sent_at: Some(
            format!("2024-05-01T09:{minute:02}:00Z")
                .parse()
                .expect("timestamp"),
        ),
        created_at: None,
    }
}

fn summary(id: i64, participant: UserId, unread: u32) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::from(id),
        participant: Participant {
            id: participant,
            name: "Dispatch".into(),
            email: None,
        },
        last_message: None,
        last_message_at: None,
        unread_count: unread,
    }
}

fn ids(messages: &[ChatMessage]) -> Vec<MessageId> {
    messages.iter().map(|message| message.id.clone()).collect()
}

async fn next_command(peer: &mut LinkPeer) -> ClientCommand {
    timeout(Duration::from_secs(30), peer.commands.recv())
        .await
        .expect("command in time")
        .expect("link open")
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("session events");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("session event in time")
}

/// Pushes a presence event and waits for it, so everything sent on the link
/// before it has been applied.
async fn settle(
    peer: &LinkPeer,
    events: &mut broadcast::Receiver<SessionEvent>,
    marker: i64,
) {
    peer.events
        .send(ServerEvent::UserOnline(PresenceNotice {
            user_id: UserId::from(marker),
        }))
        .expect("marker");
    wait_for(events, |event| {
        matches!(event, SessionEvent::PresenceChanged { user_id } if *user_id == UserId::from(marker))
    })
    .await;
}

async fn connected_session(
    api: Arc<FakeApi>,
) -> (Arc<MessagingSession>, LinkPeer, Arc<ScriptedConnector>) {
    let connector = Arc::new(ScriptedConnector::default());
    let peer = connector.push_link();
    let session = MessagingSession::new(ClientSettings::default(), api, connector.clone());
    let mut events = session.subscribe();
    session.sign_in(identity()).await;
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionChanged(status) if status.is_connected())
    })
    .await;
    (session, peer, connector)
}

fn join(conversation_id: ConversationId) -> ClientCommand {
    ClientCommand::JoinConversation { conversation_id }
}

fn typing(is_typing: bool) -> ClientCommand {
    ClientCommand::Typing {
        conversation_id: conv(),
        is_typing,
    }
}

#[tokio::test(start_paused = true)]
async fn send_falls_back_to_rest_and_refetches_when_offline() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, DISPATCH, 0)]);
    let connector = Arc::new(ScriptedConnector::default());
    let settings = ClientSettings {
        realtime_enabled: false,
        ..ClientSettings::default()
    };
    let session = MessagingSession::new(settings, api.clone(), connector.clone());
    session.sign_in(identity()).await;
    session.open_conversation(&conv()).await.expect("open");
    let fetches_before = api.fetches();

    let route = session.send(&conv(), "  on my way  ").await.expect("send");

    assert_eq!(route, SendRoute::Rest);
    assert_eq!(
        api.sent(),
        vec![SendMessageRequest {
            conversation_id: conv(),
            content: "on my way".into(),
            kind: MessageKind::Text,
        }]
    );
    assert_eq!(api.fetches(), fetches_before + 1);
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(connector.attempts(), 0);
    assert!(!session.is_connected());
    assert_eq!(
        api.token.lock().expect("token lock").as_deref(),
        Some("jwt-driver")
    );
}

#[tokio::test(start_paused = true)]
async fn failed_rest_send_surfaces_error_and_leaves_state_alone() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, ME, 0)]);
    let settings = ClientSettings {
        realtime_enabled: false,
        ..ClientSettings::default()
    };
    let session = MessagingSession::new(
        settings,
        api.clone(),
        Arc::new(ScriptedConnector::default()),
    );
    session.sign_in(identity()).await;
    session.open_conversation(&conv()).await.expect("open");
    api.reject_sends.store(true, Ordering::SeqCst);
    let fetches_before = api.fetches();

    let err = session
        .send(&conv(), "late")
        .await
        .expect_err("send rejected");

    assert!(err.chain().any(|cause| cause.to_string().contains("503")));
    assert_eq!(api.fetches(), fetches_before);
    assert_eq!(ids(&session.messages(&conv()).await), vec![MessageId::from(1)]);
}

#[tokio::test(start_paused = true)]
async fn empty_message_is_rejected_without_network() {
    let api = Arc::new(FakeApi::default());
    let (session, mut peer, _connector) = connected_session(api.clone()).await;

    let err = session.send(&conv(), " \n\t ").await.expect_err("empty");

    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::EmptyMessage)
    ));
    assert!(api.sent().is_empty());
    assert!(peer.commands.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn connected_send_emits_once_and_waits_for_echo() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, ME, 0)]);
    let (session, mut peer, _connector) = connected_session(api.clone()).await;
    let mut events = session.subscribe();

    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    let route = session.send(&conv(), "eta 10").await.expect("send");
    assert_eq!(route, SendRoute::Realtime);
    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::SendMessage {
            conversation_id: conv(),
            content: "eta 10".into(),
            kind: MessageKind::Text,
        }
    );
    assert_eq!(session.messages(&conv()).await.len(), 1, "no optimistic insert");
    assert!(api.sent().is_empty());

    peer.events
        .send(ServerEvent::MessageSent(msg(conv(), 2, ME, 1)))
        .expect("echo");
    peer.events
        .send(ServerEvent::NewMessage(msg(conv(), 2, ME, 1)))
        .expect("duplicate broadcast");
    settle(&peer, &mut events, 500).await;

    let messages = session.messages(&conv()).await;
    assert_eq!(ids(&messages), vec![MessageId::from(1), MessageId::from(2)]);
    assert!(messages[1].is_from_me);
    assert!(peer.commands.try_recv().is_err(), "own echo is never marked read");
}

#[tokio::test(start_paused = true)]
async fn mark_read_is_idempotent() {
    let api = Arc::new(FakeApi::default());
    api.set_page(
        conv(),
        vec![
            msg(conv(), 1, DISPATCH, 0),
            msg(conv(), 2, ME, 1),
            msg(conv(), 3, DISPATCH, 2),
        ],
    );
    let (session, mut peer, _connector) = connected_session(api).await;

    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));
    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::MarkRead {
            conversation_id: conv(),
            message_ids: vec![MessageId::from(1), MessageId::from(3)],
        }
    );

    assert_eq!(session.mark_read(&conv()).await, 0);
    assert_eq!(session.mark_read(&conv()).await, 0);
    assert!(peer.commands.try_recv().is_err());

    let statuses: Vec<_> = session
        .messages(&conv())
        .await
        .iter()
        .map(|message| message.status)
        .collect();
    assert_eq!(
        statuses,
        vec![MessageStatus::Read, MessageStatus::Sent, MessageStatus::Read]
    );
}

#[tokio::test(start_paused = true)]
async fn incoming_push_in_open_conversation_is_marked_read() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, ME, 0)]);
    let (session, mut peer, _connector) = connected_session(api).await;
    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    peer.events
        .send(ServerEvent::NewMessage(msg(conv(), 4, DISPATCH, 3)))
        .expect("push");

    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::MarkRead {
            conversation_id: conv(),
            message_ids: vec![MessageId::from(4)],
        }
    );
    let messages = session.messages(&conv()).await;
    assert_eq!(ids(&messages), vec![MessageId::from(1), MessageId::from(4)]);
    assert!(!messages[1].is_from_me);
}

#[tokio::test(start_paused = true)]
async fn server_read_receipt_patches_known_messages() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, ME, 0), msg(conv(), 2, ME, 1)]);
    let (session, peer, _connector) = connected_session(api).await;
    let mut events = session.subscribe();
    session.open_conversation(&conv()).await.expect("open");

    peer.events
        .send(ServerEvent::MessagesRead(ReadReceipt {
            conversation_id: conv(),
            message_ids: vec![MessageId::from(2), MessageId::from(999)],
            read_by: Some(UserId::from(DISPATCH)),
        }))
        .expect("receipt");
    settle(&peer, &mut events, 501).await;

    let statuses: Vec<_> = session
        .messages(&conv())
        .await
        .iter()
        .map(|message| message.status)
        .collect();
    assert_eq!(statuses, vec![MessageStatus::Sent, MessageStatus::Read]);
}

#[tokio::test(start_paused = true)]
async fn typing_goes_true_once_then_false_after_idle() {
    let api = Arc::new(FakeApi::default());
    let (session, mut peer, _connector) = connected_session(api).await;
    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    let start = Instant::now();
    session.input_changed(&conv(), "o").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.input_changed(&conv(), "on").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.input_changed(&conv(), "on my").await;

    assert_eq!(next_command(&mut peer).await, typing(true));
    assert!(peer.commands.try_recv().is_err());
    assert_eq!(next_command(&mut peer).await, typing(false));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1_600), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_700), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn clearing_input_or_closing_stops_typing_immediately() {
    let api = Arc::new(FakeApi::default());
    let (session, mut peer, _connector) = connected_session(api).await;
    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    session.input_changed(&conv(), "x").await;
    session.input_changed(&conv(), "").await;
    assert_eq!(next_command(&mut peer).await, typing(true));
    assert_eq!(next_command(&mut peer).await, typing(false));

    session.input_changed(&conv(), "y").await;
    session.close_conversation(&conv()).await;
    assert_eq!(next_command(&mut peer).await, typing(true));
    assert_eq!(next_command(&mut peer).await, typing(false));
    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::LeaveConversation {
            conversation_id: conv()
        }
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(peer.commands.try_recv().is_err(), "no late idle emission");
}

#[tokio::test(start_paused = true)]
async fn remote_typing_expires_without_explicit_false() {
    let api = Arc::new(FakeApi::default());
    let (session, peer, _connector) = connected_session(api).await;
    let mut events = session.subscribe();
    session.open_conversation(&conv()).await.expect("open");

    for notice in [
        TypingNotice {
            conversation_id: conv(),
            user_id: UserId::from(ME),
            is_typing: true,
        },
        TypingNotice {
            conversation_id: other_conv(),
            user_id: UserId::from(DISPATCH),
            is_typing: true,
        },
    ] {
        peer.events
            .send(ServerEvent::UserTyping(notice))
            .expect("typing");
    }
    settle(&peer, &mut events, 502).await;
    assert!(session.typing_users(&conv()).await.is_empty());
    assert!(session.typing_users(&other_conv()).await.is_empty());

    let start = Instant::now();
    peer.events
        .send(ServerEvent::UserTyping(TypingNotice {
            conversation_id: conv(),
            user_id: UserId::from(DISPATCH),
            is_typing: true,
        }))
        .expect("typing");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::TypingChanged { is_typing: true, .. })
    })
    .await;
    assert!(session.is_typing(&conv(), &UserId::from(DISPATCH)).await);

    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::TypingChanged { is_typing: false, .. })
    })
    .await;
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(!session.is_typing(&conv(), &UserId::from(DISPATCH)).await);
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_open_conversation() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, DISPATCH, 0)]);
    let connector = Arc::new(ScriptedConnector::default());
    let mut first = connector.push_link();
    let mut second = connector.push_link();
    let session = MessagingSession::new(ClientSettings::default(), api.clone(), connector.clone());
    let mut events = session.subscribe();
    session.sign_in(identity()).await;
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionChanged(status) if status.is_connected())
    })
    .await;

    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut first).await, join(conv()));
    assert!(matches!(
        next_command(&mut first).await,
        ClientCommand::MarkRead { .. }
    ));
    let fetches_before = api.fetches();

    drop(first);
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionChanged(status) if !status.is_connected())
    })
    .await;
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionChanged(status) if status.is_connected())
    })
    .await;

    assert_eq!(next_command(&mut second).await, join(conv()));
    assert_eq!(connector.attempts(), 2);

    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::MessagesChanged { conversation_id } if *conversation_id == conv())
    })
    .await;
    assert_eq!(api.fetches(), fetches_before + 1, "history refetched after reconnect");

    second
        .events
        .send(ServerEvent::NewMessage(msg(conv(), 5, DISPATCH, 9)))
        .expect("push");
    assert_eq!(
        next_command(&mut second).await,
        ClientCommand::MarkRead {
            conversation_id: conv(),
            message_ids: vec![MessageId::from(5)],
        }
    );
}

#[tokio::test(start_paused = true)]
async fn push_before_history_triggers_a_refetch() {
    let api = Arc::new(FakeApi::default());
    api.failing_fetches.store(1, Ordering::SeqCst);
    let (session, mut peer, _connector) = connected_session(api.clone()).await;
    let mut events = session.subscribe();

    session
        .open_conversation(&conv())
        .await
        .expect_err("first history load fails");
    assert!(matches!(
        session.load_phase(&conv()).await,
        LoadPhase::Failed(_)
    ));
    assert_eq!(next_command(&mut peer).await, join(conv()));

    api.set_page(conv(), vec![msg(conv(), 5, DISPATCH, 0)]);
    peer.events
        .send(ServerEvent::NewMessage(msg(conv(), 5, DISPATCH, 0)))
        .expect("push");

    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::MessagesChanged { .. })
    })
    .await;
    assert_eq!(ids(&session.messages(&conv()).await), vec![MessageId::from(5)]);
    assert_eq!(session.load_phase(&conv()).await, LoadPhase::Loaded);
    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::MarkRead {
            conversation_id: conv(),
            message_ids: vec![MessageId::from(5)],
        }
    );
}

#[tokio::test(start_paused = true)]
async fn pushes_elsewhere_bump_unread_in_the_directory() {
    let api = Arc::new(FakeApi::default());
    *api.conversations.lock().expect("conversations lock") = vec![
        summary(42, UserId::from(DISPATCH), 0),
        summary(77, UserId::from(DISPATCH), 0),
    ];
    let (session, mut peer, _connector) = connected_session(api).await;
    let mut events = session.subscribe();
    session.refresh_conversations(None).await.expect("list");
    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    peer.events
        .send(ServerEvent::NewMessage(msg(other_conv(), 8, DISPATCH, 4)))
        .expect("push elsewhere");
    settle(&peer, &mut events, 503).await;

    let conversations = session.conversations().await;
    assert_eq!(conversations[0].id, other_conv());
    assert_eq!(conversations[0].unread_count, 1);
    assert_eq!(conversations[0].last_message.as_deref(), Some("message 8"));
    assert!(peer.commands.try_recv().is_err(), "no mark-read outside the open conversation");
    assert!(session.messages(&other_conv()).await.is_empty());

    peer.events
        .send(ServerEvent::NewMessage(msg(conv(), 9, DISPATCH, 5)))
        .expect("push here");
    assert!(matches!(
        next_command(&mut peer).await,
        ClientCommand::MarkRead { .. }
    ));
    let open = session
        .conversations()
        .await
        .into_iter()
        .find(|entry| entry.id == conv())
        .expect("listed");
    assert_eq!(open.unread_count, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_push_elsewhere_counts_unread_once() {
    let api = Arc::new(FakeApi::default());
    *api.conversations.lock().expect("conversations lock") = vec![
        summary(42, UserId::from(DISPATCH), 0),
        summary(77, UserId::from(DISPATCH), 0),
    ];
    let (session, peer, _connector) = connected_session(api).await;
    let mut events = session.subscribe();
    session.refresh_conversations(None).await.expect("list");

    let mut redelivered = msg(other_conv(), 8, DISPATCH, 4);
    peer.events
        .send(ServerEvent::NewMessage(redelivered.clone()))
        .expect("push");
    redelivered.id = MessageId::from("8");
    peer.events
        .send(ServerEvent::NewMessage(redelivered))
        .expect("redelivery");
    settle(&peer, &mut events, 504).await;

    let entry = session
        .conversations()
        .await
        .into_iter()
        .find(|entry| entry.id == other_conv())
        .expect("listed");
    assert_eq!(entry.unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn string_conversation_id_reaches_the_open_conversation() {
    let api = Arc::new(FakeApi::default());
    api.set_page(conv(), vec![msg(conv(), 1, ME, 0)]);
    let (session, mut peer, _connector) = connected_session(api).await;
    let mut events = session.subscribe();
    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    let mut push = msg(ConversationId::from("42"), 4, DISPATCH, 3);
    push.id = MessageId::from("4");
    push.sender_id = UserId::from(DISPATCH.to_string());
    peer.events.send(ServerEvent::NewMessage(push)).expect("push");

    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::MarkRead {
            conversation_id: conv(),
            message_ids: vec![MessageId::from(4)],
        }
    );
    let messages = session.messages(&conv()).await;
    assert_eq!(ids(&messages), vec![MessageId::from(1), MessageId::from(4)]);
    assert!(!messages[1].is_from_me);

    let mut echo = msg(ConversationId::from("42"), 1, ME, 0);
    echo.sender_id = UserId::from(ME.to_string());
    peer.events.send(ServerEvent::MessageSent(echo)).expect("echo");
    settle(&peer, &mut events, 505).await;
    assert_eq!(session.messages(&conv()).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn switching_conversations_leaves_the_previous_room() {
    let api = Arc::new(FakeApi::default());
    let (session, mut peer, _connector) = connected_session(api).await;

    session.open_conversation(&conv()).await.expect("open first");
    session.open_conversation(&other_conv()).await.expect("open second");

    assert_eq!(next_command(&mut peer).await, join(conv()));
    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::LeaveConversation {
            conversation_id: conv()
        }
    );
    assert_eq!(next_command(&mut peer).await, join(other_conv()));
    assert_eq!(session.open_conversation_id().await, Some(other_conv()));
}

#[tokio::test(start_paused = true)]
async fn sign_out_leaves_rooms_and_disconnects() {
    let api = Arc::new(FakeApi::default());
    let (session, mut peer, connector) = connected_session(api.clone()).await;
    session.open_conversation(&conv()).await.expect("open");
    assert_eq!(next_command(&mut peer).await, join(conv()));

    session.sign_out().await;

    assert_eq!(
        next_command(&mut peer).await,
        ClientCommand::LeaveConversation {
            conversation_id: conv()
        }
    );
    assert_eq!(session.connection_status().state, ConnectionState::Disconnected);
    assert_eq!(*api.token.lock().expect("token lock"), None);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(session.messages(&conv()).await.is_empty());
    assert!(matches!(
        session.send(&conv(), "hello").await.map_err(|err| err.downcast::<ClientError>()),
        Err(Ok(ClientError::NotAuthenticated))
    ));
}

#[tokio::test(start_paused = true)]
async fn start_conversation_adds_to_directory() {
    let api = Arc::new(FakeApi::default());
    let (session, _peer, _connector) = connected_session(api).await;

    let created = session
        .start_conversation(&UserId::from("yard-3"))
        .await
        .expect("create");

    assert_eq!(created.id, ConversationId::from(900));
    assert_eq!(session.conversations().await, vec![created]);
}
