//! Client-side mirror of the chat protocol.
//!
//! A [`ClientSession`] owns one WebSocket connection at a time, renders sent
//! messages optimistically and reconciles them when the server echoes them
//! back, emits read receipts for anything it has displayed from the other
//! side, and tracks typing indicators in both directions.

pub mod state;
pub mod typing;

use futures::{ Sink, SinkExt, StreamExt };
use log::{ debug, info, warn };
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{ mpsc, watch };
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::models::chat::{ ChatMessageView, Participant, SendMessageInput };
use crate::models::websocket::{ ClientEvent, InitPayload, ReadPayload, ServerEvent, TypingPayload };
use state::SessionState;
use typing::{ TypingNotifier, TypingTracker, TypingUser, TYPING_EXPIRY, TYPING_IDLE };

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub typing_idle: Duration,
    pub typing_expiry: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), typing_idle: TYPING_IDLE, typing_expiry: TYPING_EXPIRY }
    }
}

/// Which socket, if any, the session is currently driving.
#[derive(Debug, Default)]
struct LinkSlot {
    generation: u64,
    attempted: bool,
    open: bool,
    outbox: Option<mpsc::UnboundedSender<ClientEvent>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone, Debug, Default)]
struct Link(Arc<Mutex<LinkSlot>>);

impl Link {
    fn slot(&self) -> std::sync::MutexGuard<'_, LinkSlot> {
        self.0.lock().expect("client link poisoned")
    }

    fn is_open(&self) -> bool {
        self.slot().open
    }

    fn attempted(&self) -> bool {
        self.slot().attempted
    }

    /// Queues `event` when the socket is open. Returns whether it was queued.
    fn emit(&self, event: ClientEvent) -> bool {
        let slot = self.slot();
        match (&slot.outbox, slot.open) {
            (Some(outbox), true) => outbox.send(event).is_ok(),
            _ => false,
        }
    }
}

/// Shared pieces the socket task needs; all cheap clones.
#[derive(Clone)]
struct SessionCore {
    state: Arc<Mutex<SessionState>>,
    link: Link,
    status: Arc<watch::Sender<ConnectionStatus>>,
    revision: Arc<watch::Sender<u64>>,
    incoming_typing: TypingTracker,
}

impl SessionCore {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("client state poisoned")
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("Client session {:?} -> {:?}", previous, status);
        }
    }

    fn link_opened(&self, generation: u64) -> bool {
        let mut slot = self.link.slot();
        if slot.generation != generation {
            return false;
        }
        slot.open = true;
        drop(slot);
        self.set_status(ConnectionStatus::Connected);
        true
    }

    fn link_closed(&self, generation: u64) {
        let mut slot = self.link.slot();
        if slot.generation != generation {
            return;
        }
        slot.open = false;
        slot.outbox = None;
        slot.task = None;
        drop(slot);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn handle_frame(&self, text: &str) {
        match ServerEvent::parse(text) {
            Ok(event) => self.receive(event),
            Err(e) => debug!("Ignoring server frame: {}", e),
        }
    }

    fn receive(&self, event: ServerEvent) {
        match event {
            ServerEvent::Ping => debug!("Server ping"),
            ServerEvent::Typing(typing) => {
                let relevant = {
                    let state = self.state();
                    state
                        .binding()
                        .map_or(false, |(conversation_id, me)| {
                            typing.conversation_id == conversation_id && typing.user_id != me.user_id
                        })
                };
                if relevant {
                    self.incoming_typing.receive(&typing);
                }
            }
            event => {
                let changed = self.state().apply(&event);
                if changed {
                    self.bump();
                    self.flush_read_receipts();
                }
            }
        }
    }

    /// Emits one batched `read` for every displayed message from the other side.
    fn flush_read_receipts(&self) {
        if !self.link.is_open() {
            return;
        }
        let mut state = self.state();
        let ids = state.unread_from_others();
        if ids.is_empty() {
            return;
        }
        let Some((conversation_id, me)) = state.binding() else {
            return;
        };
        let event = ClientEvent::Read(ReadPayload {
            conversation_id: conversation_id.to_string(),
            message_ids: ids.clone(),
            user_id: me.user_id.clone(),
        });
        if self.link.emit(event) {
            state.mark_receipted(&ids);
        }
    }
}

pub struct ClientSession {
    config: ClientConfig,
    core: SessionCore,
    outgoing_typing: TypingNotifier,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (revision, _) = watch::channel(0u64);
        let revision = Arc::new(revision);
        Self {
            outgoing_typing: TypingNotifier::new(config.typing_idle),
            core: SessionCore {
                state: Arc::default(),
                link: Link::default(),
                status: Arc::new(status),
                incoming_typing: TypingTracker::new(config.typing_expiry, Arc::clone(&revision)),
                revision,
            },
            config,
        }
    }

    /// Binds the session to a conversation, tearing down any previous socket.
    /// With no conversation or participant the session stays disconnected.
    pub fn connect(
        &self,
        conversation_id: Option<String>,
        participant: Option<Participant>,
        peer: Option<Participant>
    ) {
        let generation = self.teardown();
        *self.core.state() = SessionState::new(conversation_id.clone(), participant.clone());
        self.core.bump();

        let (conversation_id, participant) = match (conversation_id, participant) {
            (Some(c), Some(p)) => (c, p),
            _ => {
                self.core.set_status(ConnectionStatus::Disconnected);
                return;
            }
        };

        info!("Connecting to {} for '{}' as {}", self.config.url, conversation_id, participant.user_id);
        self.core.set_status(ConnectionStatus::Connecting);

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let init = ClientEvent::Init(InitPayload { conversation_id, participant, peer });
        let task = tokio::spawn(
            run_link(self.core.clone(), generation, self.config.url.clone(), init, outbox_rx)
        );

        let mut slot = self.core.link.slot();
        slot.attempted = true;
        slot.outbox = Some(outbox);
        slot.task = Some(task);
    }

    /// Switches to another conversation; `None` leaves the session disconnected.
    pub fn switch_conversation(
        &self,
        conversation_id: Option<String>,
        participant: Option<Participant>,
        peer: Option<Participant>
    ) {
        self.connect(conversation_id, participant, peer);
    }

    /// Drops the socket. Messages already shown stay in the list.
    pub fn disconnect(&self) {
        self.teardown();
        self.core.set_status(ConnectionStatus::Disconnected);
    }

    fn teardown(&self) -> u64 {
        self.outgoing_typing.reset();
        self.core.incoming_typing.clear();
        let mut slot = self.core.link.slot();
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.outbox = None;
        slot.open = false;
        slot.attempted = false;
        slot.generation += 1;
        slot.generation
    }

    /// Shows the message immediately and sends it when the socket is open.
    ///
    /// Returns the temporary id of the optimistic entry, or `None` when the
    /// body is blank, the session is unbound, or no connection was ever
    /// attempted for the current binding.
    pub fn send_message(&self, input: SendMessageInput) -> Option<String> {
        if !self.core.link.attempted() {
            return None;
        }
        let payload = self.core.state().compose(&input)?;
        let temp_id = payload.temp_id.clone();
        self.core.bump();

        if !self.core.link.emit(ClientEvent::Message(payload)) {
            debug!("Socket not open; message kept local only");
        }
        temp_id
    }

    /// Call on every keystroke in the composer.
    pub fn notify_typing(&self) {
        if !self.core.link.is_open() {
            return;
        }
        let (start, stop) = {
            let state = self.core.state();
            let Some((conversation_id, me)) = state.binding() else {
                return;
            };
            let notice = |is_typing| {
                ClientEvent::Typing(TypingPayload {
                    conversation_id: conversation_id.to_string(),
                    user_id: me.user_id.clone(),
                    display_name: me.display_name.clone(),
                    is_typing,
                })
            };
            (notice(true), notice(false))
        };

        let link = self.core.link.clone();
        let announce = self.outgoing_typing.poke(move || {
            link.emit(stop);
        });
        if announce {
            self.core.link.emit(start);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.core.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.core.status.subscribe()
    }

    /// Ticks whenever the message list or typing set changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.core.revision.subscribe()
    }

    pub fn messages(&self) -> Vec<ChatMessageView> {
        self.core.state().messages().to_vec()
    }

    pub fn typing_users(&self) -> Vec<TypingUser> {
        let conversation_id = {
            let state = self.core.state();
            match state.binding() {
                Some((conversation_id, _)) => conversation_id.to_string(),
                None => {
                    return Vec::new();
                }
            }
        };
        self.core.incoming_typing.typing_in(&conversation_id)
    }

    #[cfg(test)]
    fn attach_test_link(
        &self,
        conversation_id: &str,
        participant: Participant
    ) -> mpsc::UnboundedReceiver<ClientEvent> {
        let generation = self.teardown();
        *self.core.state() = SessionState::new(Some(conversation_id.to_string()), Some(participant));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut slot = self.core.link.slot();
            slot.attempted = true;
            slot.outbox = Some(tx);
        }
        self.core.link_opened(generation);
        rx
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn send_event<S>(sink: &mut S, event: &ClientEvent) -> Result<(), ClientError>
    where S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin
{
    let json = serde_json::to_string(event)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

async fn run_link(
    core: SessionCore,
    generation: u64,
    url: String,
    init: ClientEvent,
    mut outbox: mpsc::UnboundedReceiver<ClientEvent>
) {
    let websocket = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((websocket, _)) => websocket,
        Err(e) => {
            warn!("Failed to connect to {}: {}", url, ClientError::from(e));
            core.link_closed(generation);
            return;
        }
    };
    let (mut sink, mut stream) = websocket.split();

    if !core.link_opened(generation) {
        return;
    }
    if let Err(e) = send_event(&mut sink, &init).await {
        warn!("Failed to send init: {}", e);
        core.link_closed(generation);
        return;
    }

    loop {
        tokio::select! {
            outgoing = outbox.recv() => match outgoing {
                Some(event) => {
                    if let Err(e) = send_event(&mut sink, &event).await {
                        warn!("Failed to send event: {}", e);
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => core.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => {
                    info!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!("Connection error: {}", e);
                    break;
                }
            },
        }
    }
    core.link_closed(generation);
}
