pub mod autoresponse;
pub mod registry;

use chrono::Utc;
use log::{ debug, info, warn };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cli::Args;
use crate::models::chat::{ ChatMessage, MessageKind, MessageStatus, Participant };
use crate::models::websocket::{
    ClientEvent,
    HistoryPayload,
    InitPayload,
    MessageDelivery,
    MessagePayload,
    ProtocolError,
    ReadPayload,
    ServerEvent,
    StatusUpdate,
    TypingPayload,
};
use crate::responder::{ AutoResponder, ReplyTiming };
use crate::store::MessageStore;
use autoresponse::AutoResponseJob;
use registry::{ ConnectionHandle, ConnectionId, ConversationRegistry };

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    pub read_sync_delay: Duration,
    pub auto_response: bool,
    pub max_message_size: usize,
    pub reply_timing: ReplyTiming,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_sync_delay: Duration::from_millis(400),
            auto_response: true,
            max_message_size: 1024 * 1024,
            reply_timing: ReplyTiming::default(),
        }
    }
}

impl From<&Args> for GatewayConfig {
    fn from(args: &Args) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
            read_sync_delay: Duration::from_millis(args.read_sync_delay_ms),
            auto_response: args.auto_response,
            max_message_size: args.max_message_size,
            reply_timing: if args.brisk_replies { ReplyTiming::brisk() } else { ReplyTiming::default() },
        }
    }
}

/// Lifecycle of one transport connection as seen by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Unidentified,
    Active {
        conversation_id: String,
        participant: Participant,
    },
    Closed,
}

/// Per-socket protocol state. Owned by the socket task, never shared.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    outbox: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn bound_to(&self, conversation_id: &str) -> bool {
        matches!(&self.state, ConnectionState::Active { conversation_id: bound, .. } if bound == conversation_id)
    }

    fn push(&self, event: ServerEvent) {
        if self.outbox.send(event).is_err() {
            warn!("Outbox closed for connection {}", self.id);
        }
    }
}

pub struct ChatGateway {
    registry: ConversationRegistry,
    store: Arc<dyn MessageStore>,
    responder: AutoResponder,
    config: GatewayConfig,
}

impl ChatGateway {
    pub fn new(store: Arc<dyn MessageStore>, config: GatewayConfig) -> Self {
        Self {
            registry: ConversationRegistry::new(),
            responder: AutoResponder::new(config.reply_timing.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Starts tracking a new socket. Events queued on `outbox` are written by the caller.
    pub fn open_connection(&self, outbox: mpsc::UnboundedSender<ServerEvent>) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            state: ConnectionState::Unidentified,
            outbox,
        }
    }

    /// Handles one inbound text frame. Malformed or unknown frames are logged and dropped.
    pub async fn handle_frame(&self, connection: &mut Connection, text: &str) {
        if text.len() > self.config.max_message_size {
            warn!(
                "Frame from connection {} exceeds size limit ({} > {}), dropping",
                connection.id,
                text.len(),
                self.config.max_message_size
            );
            return;
        }

        match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(connection, event).await,
            Err(ProtocolError::UnknownType(kind)) => {
                debug!("Ignoring unknown event type '{}' from {}", kind, connection.id);
            }
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", connection.id, e);
            }
        }
    }

    pub async fn handle_event(&self, connection: &mut Connection, event: ClientEvent) {
        if connection.state == ConnectionState::Closed {
            return;
        }
        match event {
            ClientEvent::Init(init) => self.on_init(connection, init).await,
            _ if !connection.bound_to(event.conversation_id()) => {
                debug!(
                    "Dropping event for '{}' on connection {} ({:?})",
                    event.conversation_id(),
                    connection.id,
                    connection.state
                );
            }
            ClientEvent::Message(message) => self.on_message(connection, message).await,
            ClientEvent::Read(read) => self.on_read(read).await,
            ClientEvent::Typing(typing) => self.on_typing(connection, typing).await,
        }
    }

    async fn on_init(&self, connection: &mut Connection, init: InitPayload) {
        if let ConnectionState::Active { conversation_id, .. } = &connection.state {
            if *conversation_id != init.conversation_id {
                self.detach(connection.id, conversation_id).await;
            }
        }

        let conversation = self.registry.conversation(&init.conversation_id);
        let mut state = conversation.lock().await;

        state.register_connection(
            ConnectionHandle::new(connection.id, init.participant.clone(), connection.outbox.clone())
        );
        if let Some(peer) = init.peer.clone() {
            state.set_peer(peer);
        }

        let messages = match self.store.list_messages(&init.conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to load history for '{}': {}", init.conversation_id, e);
                Vec::new()
            }
        };
        if let Some(last) = messages.last() {
            state.observe_created_at(last.created_at);
        }

        info!(
            "Connection {} joined '{}' as {} ({} messages, {} connections)",
            connection.id,
            init.conversation_id,
            init.participant.user_id,
            messages.len(),
            state.connection_count()
        );

        connection.push(
            ServerEvent::History(HistoryPayload {
                conversation_id: init.conversation_id.clone(),
                messages,
            })
        );
        connection.state = ConnectionState::Active {
            conversation_id: init.conversation_id,
            participant: init.participant,
        };
    }

    async fn on_message(&self, origin: &Connection, payload: MessagePayload) {
        let conversation = self.registry.conversation(&payload.conversation_id);
        let mut state = conversation.lock().await;

        let sender = payload.sender();
        let created_at = state.next_created_at();
        let message = ChatMessage::sent_by(
            &payload.conversation_id,
            &sender,
            payload.body,
            payload.kind,
            payload.metadata,
            created_at
        );

        if let Err(e) = self.store.append_message(&payload.conversation_id, message.clone()).await {
            warn!("Failed to append message to '{}': {}", payload.conversation_id, e);
            return;
        }
        debug!("Appended {} to '{}' from {}", message.id, payload.conversation_id, sender.user_id);

        for handle in state.connections(None) {
            let temp_id = if handle.id == origin.id || handle.participant.user_id == sender.user_id {
                payload.temp_id.clone()
            } else {
                None
            };
            handle.deliver(
                ServerEvent::Message(MessageDelivery {
                    conversation_id: payload.conversation_id.clone(),
                    message: message.clone(),
                    temp_id,
                })
            );
        }

        if !self.config.auto_response || message.kind == MessageKind::Reaction {
            return;
        }
        let peer = match state.peer() {
            Some(peer) if peer.user_id != sender.user_id => peer.clone(),
            _ => {
                return;
            }
        };

        let history = match self.store.list_messages(&payload.conversation_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load history for auto-response: {}", e);
                return;
            }
        };
        let plan = self.responder.plan(&peer, &history, &mut rand::rng());
        debug!(
            "Scheduling auto-response in '{}': typing {:?}, send {:?}",
            payload.conversation_id,
            plan.typing_duration,
            plan.send_delay
        );

        autoresponse::schedule(
            &mut state,
            Arc::clone(&conversation),
            Arc::clone(&self.store),
            AutoResponseJob {
                conversation_id: payload.conversation_id,
                peer,
                human_id: sender.user_id,
                plan,
                read_sync_delay: self.config.read_sync_delay,
            }
        );
    }

    async fn on_read(&self, read: ReadPayload) {
        let conversation = self.registry.conversation(&read.conversation_id);
        let state = conversation.lock().await;

        for message_id in &read.message_ids {
            let message = match self.store.get_message(&read.conversation_id, message_id).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    continue;
                }
                Err(e) => {
                    warn!("Failed to look up {}: {}", message_id, e);
                    continue;
                }
            };
            if message.sender_id == read.user_id {
                continue;
            }

            let updated = self.store.update_message_status(
                &read.conversation_id,
                message_id,
                MessageStatus::Read,
                Utc::now()
            ).await;
            match updated {
                Ok(Some(updated)) => {
                    state.broadcast(
                        &ServerEvent::MessageStatus(StatusUpdate {
                            conversation_id: read.conversation_id.clone(),
                            message_id: updated.id,
                            status: updated.status,
                            at: updated.read_at.unwrap_or_else(Utc::now),
                            actor_id: read.user_id.clone(),
                        }),
                        None
                    );
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to mark {} read: {}", message_id, e),
            }
        }
    }

    async fn on_typing(&self, connection: &Connection, typing: TypingPayload) {
        let conversation = self.registry.conversation(&typing.conversation_id);
        let state = conversation.lock().await;
        state.broadcast(&ServerEvent::Typing(typing), Some(connection.id));
    }

    /// Sends the keep-alive ping to an active connection. A failed send is only
    /// logged; the close path cleans up.
    pub fn heartbeat(&self, connection: &Connection) {
        if !matches!(connection.state, ConnectionState::Active { .. }) {
            return;
        }
        if connection.outbox.send(ServerEvent::Ping).is_err() {
            warn!("Heartbeat failed for connection {}", connection.id);
        }
    }

    /// Removes the connection from its conversation. Pending auto-responses keep running.
    pub async fn close_connection(&self, connection: &mut Connection) {
        if let ConnectionState::Active { conversation_id, .. } = &connection.state {
            self.detach(connection.id, conversation_id).await;
        }
        connection.state = ConnectionState::Closed;
    }

    async fn detach(&self, id: ConnectionId, conversation_id: &str) {
        if let Some(conversation) = self.registry.existing(conversation_id) {
            let mut state = conversation.lock().await;
            if state.unregister_connection(id) {
                info!(
                    "Connection {} left '{}' ({} remaining)",
                    id,
                    conversation_id,
                    state.connection_count()
                );
            }
        }
    }

    pub async fn shutdown(&self) {
        self.registry.cancel_all_pending().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;

    fn gateway(auto_response: bool) -> ChatGateway {
        let config = GatewayConfig { auto_response, ..GatewayConfig::default() };
        ChatGateway::new(Arc::new(InMemoryMessageStore::new()), config)
    }

    fn seeker() -> Participant {
        Participant::new("u1", "Ada", "#111")
    }

    fn peer() -> Participant {
        Participant::new("u2", "Sam", "#222")
    }

    async fn join(
        gateway: &ChatGateway,
        who: Participant,
        peer: Option<Participant>
    ) -> (Connection, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = gateway.open_connection(tx);
        gateway.handle_event(
            &mut connection,
            ClientEvent::Init(InitPayload { conversation_id: "c1".into(), participant: who, peer })
        ).await;
        match rx.try_recv() {
            Ok(ServerEvent::History(_)) => {}
            other => panic!("expected history, got {:?}", other),
        }
        (connection, rx)
    }

    fn say(from: &Participant, temp_id: &str, body: &str) -> ClientEvent {
        ClientEvent::Message(MessagePayload {
            conversation_id: "c1".into(),
            temp_id: Some(temp_id.into()),
            body: body.into(),
            kind: MessageKind::Text,
            metadata: None,
            sender_id: from.user_id.clone(),
            sender_name: from.display_name.clone(),
            sender_avatar_color: from.avatar_color.clone(),
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn events_before_init_are_ignored() {
        let gateway = gateway(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = gateway.open_connection(tx);

        gateway.handle_event(&mut connection, say(&seeker(), "t1", "gm")).await;
        gateway.handle_frame(&mut connection, "{\"type\":\"nope\"}").await;
        gateway.handle_frame(&mut connection, "garbage").await;

        assert_eq!(connection.state(), &ConnectionState::Unidentified);
        assert!(drain(&mut rx).is_empty());
        assert!(gateway.store().list_messages("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_fans_out_with_temp_id_only_to_sender() {
        let gateway = gateway(false);
        let (mut a, mut a_rx) = join(&gateway, seeker(), Some(peer())).await;
        let (_b, mut b_rx) = join(&gateway, peer(), None).await;

        gateway.handle_event(&mut a, say(&seeker(), "t1", "gm")).await;

        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        assert_eq!(a_events.len(), 1);
        assert_eq!(b_events.len(), 1);
        match (&a_events[0], &b_events[0]) {
            (ServerEvent::Message(mine), ServerEvent::Message(theirs)) => {
                assert_eq!(mine.temp_id.as_deref(), Some("t1"));
                assert!(theirs.temp_id.is_none());
                assert_eq!(mine.message, theirs.message);
                assert_ne!(mine.message.id, "t1");
                assert_eq!(mine.message.status, MessageStatus::Sent);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn history_is_sorted_and_sent_on_init() {
        let gateway = gateway(false);
        let (mut a, _a_rx) = join(&gateway, seeker(), None).await;
        for (i, body) in ["one", "two", "three"].iter().enumerate() {
            gateway.handle_event(&mut a, say(&seeker(), &format!("t{}", i), body)).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut late = gateway.open_connection(tx);
        gateway.handle_event(
            &mut late,
            ClientEvent::Init(InitPayload {
                conversation_id: "c1".into(),
                participant: peer(),
                peer: None,
            })
        ).await;

        match rx.try_recv().unwrap() {
            ServerEvent::History(history) => {
                let bodies: Vec<&str> = history.messages
                    .iter()
                    .map(|m| m.body.as_str())
                    .collect();
                assert_eq!(bodies, vec!["one", "two", "three"]);
                assert!(history.messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
            }
            other => panic!("expected history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_only_touches_messages_from_others() {
        let gateway = gateway(false);
        let (mut a, mut a_rx) = join(&gateway, seeker(), None).await;
        let (mut b, mut b_rx) = join(&gateway, peer(), None).await;

        gateway.handle_event(&mut a, say(&seeker(), "t1", "from ada")).await;
        gateway.handle_event(&mut b, say(&peer(), "t2", "from sam")).await;
        let ids: Vec<String> = gateway
            .store()
            .list_messages("c1").await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        drain(&mut a_rx);
        drain(&mut b_rx);

        gateway.handle_event(
            &mut a,
            ClientEvent::Read(ReadPayload {
                conversation_id: "c1".into(),
                message_ids: ids.clone(),
                user_id: "u1".into(),
            })
        ).await;

        let stored = gateway.store().list_messages("c1").await.unwrap();
        assert_eq!(stored[0].status, MessageStatus::Sent);
        assert_eq!(stored[1].status, MessageStatus::Read);

        let updates = drain(&mut b_rx);
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            ServerEvent::MessageStatus(update) => {
                assert_eq!(update.message_id, ids[1]);
                assert_eq!(update.actor_id, "u1");
                assert_eq!(update.status, MessageStatus::Read);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(drain(&mut a_rx).len(), 1);

        // already read: no second broadcast
        gateway.handle_event(
            &mut a,
            ClientEvent::Read(ReadPayload {
                conversation_id: "c1".into(),
                message_ids: ids,
                user_id: "u1".into(),
            })
        ).await;
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn typing_excludes_origin() {
        let gateway = gateway(false);
        let (mut a, mut a_rx) = join(&gateway, seeker(), None).await;
        let (_b, mut b_rx) = join(&gateway, peer(), None).await;

        let typing = TypingPayload {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            display_name: "Ada".into(),
            is_typing: true,
        };
        gateway.handle_event(&mut a, ClientEvent::Typing(typing.clone())).await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec![ServerEvent::Typing(typing)]);
    }

    #[tokio::test]
    async fn events_for_other_conversations_are_dropped() {
        let gateway = gateway(false);
        let (mut a, mut a_rx) = join(&gateway, seeker(), None).await;

        let mut stray = say(&seeker(), "t1", "wrong room");
        if let ClientEvent::Message(ref mut payload) = stray {
            payload.conversation_id = "c2".into();
        }
        gateway.handle_event(&mut a, stray).await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(gateway.store().list_messages("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_unregisters_connection() {
        let gateway = gateway(false);
        let (mut a, _a_rx) = join(&gateway, seeker(), None).await;
        let (mut b, mut b_rx) = join(&gateway, peer(), None).await;
        assert_eq!(gateway.registry().connection_count().await, 2);

        gateway.close_connection(&mut b).await;
        assert_eq!(b.state(), &ConnectionState::Closed);
        assert_eq!(gateway.registry().connection_count().await, 1);

        gateway.handle_event(&mut a, say(&seeker(), "t1", "anyone?")).await;
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn heartbeat_queues_ping() {
        let gateway = gateway(false);
        let (a, mut a_rx) = join(&gateway, seeker(), None).await;
        gateway.heartbeat(&a);
        assert_eq!(drain(&mut a_rx), vec![ServerEvent::Ping]);
    }

    #[tokio::test]
    async fn heartbeat_skips_connections_without_init() {
        let gateway = gateway(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = gateway.open_connection(tx);

        gateway.heartbeat(&connection);
        assert!(drain(&mut rx).is_empty());

        gateway.close_connection(&mut connection).await;
        gateway.heartbeat(&connection);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn temp_id_returns_to_originating_socket_even_with_foreign_sender_id() {
        let gateway = gateway(false);
        let (mut a, mut a_rx) = join(&gateway, seeker(), None).await;
        let (_b, mut b_rx) = join(&gateway, peer(), None).await;

        let stranger = Participant::new("u9", "Mo", "#999");
        gateway.handle_event(&mut a, say(&stranger, "t1", "who am I")).await;

        match &drain(&mut a_rx)[..] {
            [ServerEvent::Message(mine)] => assert_eq!(mine.temp_id.as_deref(), Some("t1")),
            other => panic!("unexpected events: {:?}", other),
        }
        match &drain(&mut b_rx)[..] {
            [ServerEvent::Message(theirs)] => assert!(theirs.temp_id.is_none()),
            other => panic!("unexpected events: {:?}", other),
        }
    }
}
