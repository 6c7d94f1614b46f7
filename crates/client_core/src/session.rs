//! The messaging session: one authenticated user, one connection, and the
//! reconciled view of their conversations.
//!
//! Every mutation of session state happens under one lock and runs to
//! completion before the next connection event is applied, so events are
//! handled strictly in transport order.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use anyhow::{Context, Result};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, MessageKind, UserId},
    protocol::{
        ClientCommand, ConversationListQuery, ConversationSummary, MessagePageQuery,
        MessagePayload, ReadReceipt, SendMessageRequest, ServerEvent, TypingNotice,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    connection::{ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus},
    directory::ConversationDirectory,
    error::ClientError,
    presence::{PresenceSet, TypingDebouncer, TypingTracker},
    reconciler::{ChatMessage, LoadPhase, MergeOutcome, MessageCache, PushKind},
    rest::{HttpMessagingApi, MessagingApi},
    rooms::RoomMembership,
    transport::{Connector, SocketIoConnector},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionStatus),
    MessagesChanged {
        conversation_id: ConversationId,
    },
    HistoryFailed {
        conversation_id: ConversationId,
        message: String,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    ConversationsChanged,
    PresenceChanged {
        user_id: UserId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRoute {
    Realtime,
    Rest,
}

#[derive(Default)]
struct SessionState {
    identity: Option<Identity>,
    link_live: bool,
    rooms: RoomMembership,
    cache: MessageCache,
    directory: ConversationDirectory,
    typing: TypingTracker,
    typing_timers: HashMap<(ConversationId, UserId), JoinHandle<()>>,
    debouncer: TypingDebouncer,
    debounce_timer: Option<JoinHandle<()>>,
    presence: PresenceSet,
}

impl SessionState {
    fn new(settings: &ClientSettings) -> Self {
        Self {
            typing: TypingTracker::new(settings.typing_expiry),
            debouncer: TypingDebouncer::new(settings.typing_idle),
            ..Self::default()
        }
    }

    fn me(&self) -> Option<&UserId> {
        self.identity.as_ref().map(|identity| &identity.user_id)
    }

    fn cancel_debounce(&mut self) {
        if let Some(timer) = self.debounce_timer.take() {
            timer.abort();
        }
    }

    fn clear_typing(&mut self, conversation_id: &ConversationId) {
        self.typing.clear_conversation(conversation_id);
        self.typing_timers.retain(|(conversation, _), timer| {
            if conversation == conversation_id {
                timer.abort();
                false
            } else {
                true
            }
        });
    }

    fn reset(&mut self) {
        self.cancel_debounce();
        for (_, timer) in self.typing_timers.drain() {
            timer.abort();
        }
        self.debouncer.reset();
        self.typing.clear();
        self.cache.clear();
        self.directory.clear();
        self.presence.clear();
        self.rooms = RoomMembership::default();
    }
}

pub struct MessagingSession {
    settings: ClientSettings,
    api: Arc<dyn MessagingApi>,
    connection: ConnectionManager,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    pump: JoinHandle<()>,
}

impl MessagingSession {
    /// Builds a session and starts consuming connection events. Must be
    /// called from within a tokio runtime.
    pub fn new(
        settings: ClientSettings,
        api: Arc<dyn MessagingApi>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let connection = ConnectionManager::from_settings(connector, &settings);
        let connection_events = BroadcastStream::new(connection.subscribe());
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|session| Self {
            inner: Mutex::new(SessionState::new(&settings)),
            settings,
            api,
            connection,
            events,
            pump: tokio::spawn(run_pump(session.clone(), connection_events)),
        })
    }

    pub fn from_settings(settings: ClientSettings) -> Result<Arc<Self>> {
        let api = HttpMessagingApi::new(&settings).context("failed to build http client")?;
        let connector = SocketIoConnector::from_settings(&settings)?;
        Ok(Self::new(settings, Arc::new(api), Arc::new(connector)))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Installs the signed-in user. The same identity again is a no-op; a
    /// different token reconnects and a different user starts from an
    /// empty cache.
    pub async fn sign_in(&self, identity: Identity) {
        {
            let mut state = self.inner.lock().await;
            if state.identity.as_ref() == Some(&identity) {
                return;
            }
            let user_changed = state
                .me()
                .is_some_and(|current| current != &identity.user_id);
            if user_changed {
                state.reset();
            }
            info!(user_id = %identity.user_id, "session: signed in");
            state.identity = Some(identity.clone());
        }
        self.api
            .set_access_token(Some(identity.access_token.clone()))
            .await;
        self.connection.connect(&identity.access_token).await;
    }

    pub async fn sign_out(&self) {
        {
            let mut state = self.inner.lock().await;
            if state.identity.is_none() {
                return;
            }
            let live = state.link_live;
            let open = state.rooms.open_conversation().cloned();
            state.cancel_debounce();
            if let (Some(conversation_id), Some(is_typing)) = (open, state.debouncer.stop()) {
                if live {
                    self.connection
                        .emit(ClientCommand::Typing {
                            conversation_id,
                            is_typing,
                        })
                        .await;
                }
            }
            for command in state.rooms.leave_all(live) {
                self.connection.emit(command).await;
            }
            state.reset();
            state.identity = None;
            state.link_live = false;
            info!("session: signed out");
        }
        self.api.set_access_token(None).await;
        self.connection.disconnect().await;
    }

    /// Restarts a connection that exhausted its attempts.
    pub async fn reconnect(&self) {
        self.connection.reconnect().await;
    }

    /// Makes `conversation_id` the open conversation: joins its room (or
    /// defers the join until the link is live), then loads history and marks
    /// incoming messages read.
    pub async fn open_conversation(self: &Arc<Self>, conversation_id: &ConversationId) -> Result<()> {
        {
            let mut state = self.inner.lock().await;
            if let Some(previous) = state.rooms.open_conversation().cloned() {
                if &previous != conversation_id {
                    self.stop_typing(&mut state, &previous).await;
                    state.clear_typing(&previous);
                }
            }
            let live = state.link_live;
            for command in state.rooms.open(conversation_id, live) {
                self.connection.emit(command).await;
            }
        }
        debug!(conversation_id = %conversation_id, "session: conversation opened");
        self.load_history(conversation_id).await
    }

    pub async fn close_conversation(&self, conversation_id: &ConversationId) {
        let mut state = self.inner.lock().await;
        if state.rooms.is_open(conversation_id) {
            self.stop_typing(&mut state, conversation_id).await;
            state.clear_typing(conversation_id);
        }
        let live = state.link_live;
        for command in state.rooms.close(conversation_id, live) {
            self.connection.emit(command).await;
        }
    }

    pub async fn open_conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.rooms.open_conversation().cloned()
    }

    /// Fetches the first history page and reconciles it with what is held.
    pub async fn load_history(&self, conversation_id: &ConversationId) -> Result<()> {
        let me = {
            let mut state = self.inner.lock().await;
            let me = state.me().cloned().ok_or(ClientError::NotAuthenticated)?;
            state.cache.begin_load(conversation_id);
            me
        };
        let page = MessagePageQuery {
            page: Some(1),
            limit: Some(self.settings.history_page_size),
        };
        let fetched = self.api.fetch_messages(conversation_id, &page).await;

        let mut state = self.inner.lock().await;
        if state.me() != Some(&me) {
            debug!(conversation_id = %conversation_id, "session: dropping history for a previous user");
            return Ok(());
        }
        match fetched {
            Ok(messages) => {
                debug!(conversation_id = %conversation_id, count = messages.len(), "session: history loaded");
                state.cache.complete_load(conversation_id, messages, &me);
                self.notify(SessionEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });
                if state.rooms.is_open(conversation_id) {
                    self.mark_read_locked(&mut state, conversation_id).await;
                }
                Ok(())
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "session: history fetch failed: {err}");
                state.cache.fail_load(conversation_id, err.to_string());
                self.notify(SessionEvent::HistoryFailed {
                    conversation_id: conversation_id.clone(),
                    message: err.to_string(),
                });
                Err(err).with_context(|| format!("failed to load messages for {conversation_id}"))
            }
        }
    }

    /// Sends over the live link when there is one, otherwise over REST
    /// followed by a refetch. Nothing is inserted locally; the message shows
    /// up through the echo or the refetch.
    pub async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<SendRoute> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage.into());
        }
        {
            let state = self.inner.lock().await;
            if state.identity.is_none() {
                return Err(ClientError::NotAuthenticated.into());
            }
            if state.link_live {
                let sent = self
                    .connection
                    .emit(ClientCommand::SendMessage {
                        conversation_id: conversation_id.clone(),
                        content: content.to_string(),
                        kind: MessageKind::Text,
                    })
                    .await;
                if sent {
                    return Ok(SendRoute::Realtime);
                }
                debug!(conversation_id = %conversation_id, "session: link went away, sending over rest");
            }
        }

        self.api
            .send_message(&SendMessageRequest {
                conversation_id: conversation_id.clone(),
                content: content.to_string(),
                kind: MessageKind::Text,
            })
            .await
            .with_context(|| format!("failed to send message to {conversation_id}"))?;

        if let Err(err) = self.load_history(conversation_id).await {
            warn!("session: refetch after send failed: {err:#}");
        }
        if let Err(err) = self.refresh_conversations(None).await {
            warn!("session: conversation refresh after send failed: {err:#}");
        }
        Ok(SendRoute::Rest)
    }

    /// Feeds the composer contents for the open conversation into the typing
    /// debouncer. Nothing is emitted while offline.
    pub async fn input_changed(self: &Arc<Self>, conversation_id: &ConversationId, content: &str) {
        let mut state = self.inner.lock().await;
        if !state.rooms.is_open(conversation_id) {
            return;
        }
        if !state.link_live {
            state.cancel_debounce();
            state.debouncer.reset();
            return;
        }
        if let Some(is_typing) = state.debouncer.input_changed(content, Instant::now()) {
            self.connection
                .emit(ClientCommand::Typing {
                    conversation_id: conversation_id.clone(),
                    is_typing,
                })
                .await;
        }
        state.cancel_debounce();
        if let Some(deadline) = state.debouncer.deadline() {
            let session = Arc::downgrade(self);
            let conversation_id = conversation_id.clone();
            state.debounce_timer = Some(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(session) = session.upgrade() {
                    session.typing_idle(&conversation_id).await;
                }
            }));
        }
    }

    async fn typing_idle(&self, conversation_id: &ConversationId) {
        let mut state = self.inner.lock().await;
        state.debounce_timer = None;
        if !state.rooms.is_open(conversation_id) {
            return;
        }
        if let Some(is_typing) = state.debouncer.poll(Instant::now()) {
            if state.link_live {
                self.connection
                    .emit(ClientCommand::Typing {
                        conversation_id: conversation_id.clone(),
                        is_typing,
                    })
                    .await;
            }
        }
    }

    async fn stop_typing(&self, state: &mut SessionState, conversation_id: &ConversationId) {
        state.cancel_debounce();
        if let Some(is_typing) = state.debouncer.stop() {
            if state.link_live {
                self.connection
                    .emit(ClientCommand::Typing {
                        conversation_id: conversation_id.clone(),
                        is_typing,
                    })
                    .await;
            }
        }
    }

    /// Marks every held incoming unread message of the conversation read.
    /// Returns how many were marked; a second call finds nothing to do.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> usize {
        let mut state = self.inner.lock().await;
        self.mark_read_locked(&mut state, conversation_id).await
    }

    async fn mark_read_locked(&self, state: &mut SessionState, conversation_id: &ConversationId) -> usize {
        if !state.link_live {
            return 0;
        }
        let message_ids = state.cache.unread_incoming(conversation_id);
        if message_ids.is_empty() {
            return 0;
        }
        let emitted = self
            .connection
            .emit(ClientCommand::MarkRead {
                conversation_id: conversation_id.clone(),
                message_ids: message_ids.clone(),
            })
            .await;
        if !emitted {
            return 0;
        }
        let marked = state.cache.apply_read_receipt(conversation_id, &message_ids);
        self.notify(SessionEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        if state.directory.mark_read(conversation_id) {
            self.notify(SessionEvent::ConversationsChanged);
        }
        debug!(conversation_id = %conversation_id, marked, "session: marked read");
        marked
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .await
            .cache
            .messages(conversation_id)
            .map(<[ChatMessage]>::to_vec)
            .unwrap_or_default()
    }

    pub async fn load_phase(&self, conversation_id: &ConversationId) -> LoadPhase {
        self.inner.lock().await.cache.phase(conversation_id)
    }

    pub async fn is_typing(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.inner
            .lock()
            .await
            .typing
            .is_typing(conversation_id, user_id, Instant::now())
    }

    pub async fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.inner
            .lock()
            .await
            .typing
            .typing_users(conversation_id, Instant::now())
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.lock().await.presence.is_online(user_id)
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.directory.list().to_vec()
    }

    pub async fn refresh_conversations(&self, search: Option<String>) -> Result<Vec<ConversationSummary>> {
        let filtered = search.is_some();
        let conversations = self
            .api
            .list_conversations(&ConversationListQuery {
                search,
                limit: None,
            })
            .await
            .context("failed to list conversations")?;
        if !filtered {
            self.inner
                .lock()
                .await
                .directory
                .replace(conversations.clone());
            self.notify(SessionEvent::ConversationsChanged);
        }
        Ok(conversations)
    }

    pub async fn start_conversation(&self, participant_id: &UserId) -> Result<ConversationSummary> {
        let created = self
            .api
            .create_conversation(participant_id)
            .await
            .with_context(|| format!("failed to start conversation with {participant_id}"))?;
        self.inner.lock().await.directory.upsert(created.clone());
        self.notify(SessionEvent::ConversationsChanged);
        Ok(created)
    }

    async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                let mut state = self.inner.lock().await;
                state.link_live = true;
                for command in state.rooms.on_connected() {
                    self.connection.emit(command).await;
                }
                self.notify(SessionEvent::ConnectionChanged(ConnectionStatus {
                    state: ConnectionState::Connected,
                    last_error: None,
                }));
                if let Some(open) = state.rooms.open_conversation().cloned() {
                    self.mark_read_locked(&mut state, &open).await;
                    self.spawn_history_load(open);
                }
            }
            ConnectionEvent::Disconnected { reason } => {
                let mut state = self.inner.lock().await;
                state.link_live = false;
                state.rooms.on_disconnected();
                state.cancel_debounce();
                state.debouncer.reset();
                info!(reason = %reason, "session: link down");
                // The manager may already be back up; report the drop itself.
                let status = match self.connection.status() {
                    status if status.is_connected() => ConnectionStatus {
                        state: ConnectionState::Connecting,
                        last_error: Some(reason),
                    },
                    status => status,
                };
                self.notify(SessionEvent::ConnectionChanged(status));
            }
            ConnectionEvent::ConnectError { attempt, message } => {
                debug!(attempt, "session: connect error: {message}");
                self.notify(SessionEvent::ConnectionChanged(ConnectionStatus {
                    state: ConnectionState::Connecting,
                    last_error: Some(message),
                }));
            }
            ConnectionEvent::GaveUp { attempts } => {
                warn!(attempts, "session: realtime unavailable, sends fall back to rest");
                self.notify(SessionEvent::ConnectionChanged(self.connection.status()));
            }
            ConnectionEvent::Server(event) => self.handle_server_event(event).await,
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(message) => self.on_push(message, PushKind::Received).await,
            ServerEvent::MessageSent(message) => self.on_push(message, PushKind::SentEcho).await,
            ServerEvent::UserTyping(notice) => self.on_typing(notice).await,
            ServerEvent::MessagesRead(receipt) => self.on_read_receipt(receipt).await,
            ServerEvent::UserOnline(notice) => {
                let mut state = self.inner.lock().await;
                if state.presence.mark_online(notice.user_id.clone()) {
                    self.notify(SessionEvent::PresenceChanged {
                        user_id: notice.user_id,
                    });
                }
            }
        }
    }

    async fn on_push(self: &Arc<Self>, message: MessagePayload, kind: PushKind) {
        let mut state = self.inner.lock().await;
        let Some(me) = state.me().cloned() else {
            return;
        };
        let conversation_id = message.conversation_id.clone();
        let is_open = state.rooms.is_open(&conversation_id);
        let from_me = kind == PushKind::SentEcho || message.sender_id == me;

        if state.directory.note_message(
            &conversation_id,
            &message.id,
            &message.content,
            message.timestamp(),
            !is_open && !from_me,
        ) {
            self.notify(SessionEvent::ConversationsChanged);
        }

        match state.cache.merge_push(message, kind, &me) {
            MergeOutcome::Appended => {
                self.notify(SessionEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });
                if is_open && !from_me {
                    self.mark_read_locked(&mut state, &conversation_id).await;
                }
            }
            MergeOutcome::Duplicate => {
                debug!(conversation_id = %conversation_id, "session: duplicate push dropped");
            }
            MergeOutcome::NoCache if is_open => {
                debug!(conversation_id = %conversation_id, "session: push before history, refetching");
                self.spawn_history_load(conversation_id);
            }
            MergeOutcome::NoCache => {}
        }
    }

    async fn on_typing(self: &Arc<Self>, notice: TypingNotice) {
        let mut state = self.inner.lock().await;
        if !state.rooms.is_open(&notice.conversation_id) {
            return;
        }
        if state.me() == Some(&notice.user_id) {
            return;
        }
        let key = (notice.conversation_id.clone(), notice.user_id.clone());
        if let Some(previous) = state.typing_timers.remove(&key) {
            previous.abort();
        }
        let deadline = state.typing.observe(
            &notice.conversation_id,
            &notice.user_id,
            notice.is_typing,
            Instant::now(),
        );
        if let Some(deadline) = deadline {
            let session = Arc::downgrade(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(session) = session.upgrade() {
                    session.expire_typing().await;
                }
            });
            state.typing_timers.insert(key, timer);
        }
        self.notify(SessionEvent::TypingChanged {
            conversation_id: notice.conversation_id,
            user_id: notice.user_id,
            is_typing: notice.is_typing,
        });
    }

    async fn expire_typing(&self) {
        let mut state = self.inner.lock().await;
        for (conversation_id, user_id) in state.typing.expire(Instant::now()) {
            state
                .typing_timers
                .remove(&(conversation_id.clone(), user_id.clone()));
            self.notify(SessionEvent::TypingChanged {
                conversation_id,
                user_id,
                is_typing: false,
            });
        }
    }

    async fn on_read_receipt(&self, receipt: ReadReceipt) {
        let mut state = self.inner.lock().await;
        let changed = state
            .cache
            .apply_read_receipt(&receipt.conversation_id, &receipt.message_ids);
        if changed > 0 {
            self.notify(SessionEvent::MessagesChanged {
                conversation_id: receipt.conversation_id,
            });
        }
    }

    fn spawn_history_load(self: &Arc<Self>, conversation_id: ConversationId) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = session.load_history(&conversation_id).await {
                warn!("session: background history load failed: {err:#}");
            }
        });
    }
}

impl Drop for MessagingSession {
    fn drop(&mut self) {
        self.pump.abort();
        self.inner.get_mut().reset();
    }
}

async fn run_pump(session: Weak<MessagingSession>, mut events: BroadcastStream<ConnectionEvent>) {
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "session: connection events lagged");
                continue;
            }
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        session.handle_connection_event(event).await;
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
