use chrono::{ DateTime, Utc };
use log::{ debug, warn };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex as StdMutex };
use tokio::sync::{ mpsc, Mutex };
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::chat::Participant;
use crate::models::websocket::ServerEvent;

pub type ConnectionId = Uuid;

/// Registry-side view of one live socket: who it belongs to and where to push events.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub participant: Participant,
    outbox: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        participant: Participant,
        outbox: mpsc::UnboundedSender<ServerEvent>
    ) -> Self {
        Self { id, participant, outbox }
    }

    /// Queues an event for the socket writer. Never blocks; a dead socket is logged and skipped.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.outbox.send(event) {
            Ok(()) => true,
            Err(_) => {
                warn!("Dropping event for closed connection {} ({})", self.id, self.participant.user_id);
                false
            }
        }
    }
}

#[derive(Debug)]
struct PendingAutoResponse {
    generation: u64,
    token: CancellationToken,
}

/// Everything the gateway shares between the connections of one conversation.
/// Always accessed through the conversation's mutex.
#[derive(Debug, Default)]
pub struct ConversationState {
    connections: Vec<ConnectionHandle>,
    peer: Option<Participant>,
    pending: Option<PendingAutoResponse>,
    generation: u64,
    last_created_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn register_connection(&mut self, handle: ConnectionHandle) {
        self.connections.retain(|c| c.id != handle.id);
        self.connections.push(handle);
    }

    pub fn unregister_connection(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != id);
        before != self.connections.len()
    }

    pub fn connections(&self, exclude: Option<ConnectionId>) -> impl Iterator<Item = &ConnectionHandle> {
        self.connections.iter().filter(move |c| Some(c.id) != exclude)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn peer(&self) -> Option<&Participant> {
        self.peer.as_ref()
    }

    pub fn set_peer(&mut self, peer: Participant) {
        self.peer = Some(peer);
    }

    /// Fans `event` out to every connection except `exclude`. Returns how many accepted it.
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        self.connections(exclude)
            .filter(|c| c.deliver(event.clone()))
            .count()
    }

    /// Timestamp for the next appended message: now, but never behind the previous one.
    pub fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_created_at = Some(stamp);
        stamp
    }

    pub fn observe_created_at(&mut self, created_at: DateTime<Utc>) {
        if self.last_created_at.map_or(true, |last| created_at > last) {
            self.last_created_at = Some(created_at);
        }
    }

    /// Cancels any in-flight auto-response and registers a new one. The
    /// returned generation identifies the new lifecycle.
    pub fn replace_pending(&mut self, token: CancellationToken) -> u64 {
        if let Some(previous) = self.pending.take() {
            debug!("Cancelling auto-response generation {}", previous.generation);
            previous.token.cancel();
        }
        self.generation += 1;
        self.pending = Some(PendingAutoResponse { generation: self.generation, token });
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.pending.as_ref().map_or(false, |p| p.generation == generation)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Clears the pending registration if it still belongs to `generation`.
    pub fn clear_pending(&mut self, generation: u64) -> bool {
        if self.is_current(generation) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn cancel_pending(&mut self) {
        if let Some(previous) = self.pending.take() {
            previous.token.cancel();
        }
    }
}

/// Process-wide table of conversations. Created at startup and injected into the gateway.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: StdMutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state cell for `conversation_id`, creating it on first use.
    pub fn conversation(&self, conversation_id: &str) -> Arc<Mutex<ConversationState>> {
        let mut conversations = self.conversations.lock().expect("conversation registry poisoned");
        Arc::clone(conversations.entry(conversation_id.to_string()).or_default())
    }

    pub fn existing(&self, conversation_id: &str) -> Option<Arc<Mutex<ConversationState>>> {
        let conversations = self.conversations.lock().expect("conversation registry poisoned");
        conversations.get(conversation_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<ConversationState>>> {
        let conversations = self.conversations.lock().expect("conversation registry poisoned");
        conversations.values().cloned().collect()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().expect("conversation registry poisoned").len()
    }

    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for conversation in self.snapshot() {
            total += conversation.lock().await.connection_count();
        }
        total
    }

    pub async fn cancel_all_pending(&self) {
        for conversation in self.snapshot() {
            conversation.lock().await.cancel_pending();
        }
    }
}
