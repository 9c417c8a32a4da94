use chrono::Utc;
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::chat::{ ChatMessage, ChatMessageView, MessageStatus, Participant, SendMessageInput };
use crate::models::websocket::{ MessageDelivery, MessagePayload, ServerEvent, StatusUpdate };

/// Local message list of one session binding, free of any I/O.
#[derive(Debug, Default)]
pub struct SessionState {
    conversation_id: Option<String>,
    participant: Option<Participant>,
    messages: Vec<ChatMessageView>,
    receipted: HashSet<String>,
}

impl SessionState {
    pub fn new(conversation_id: Option<String>, participant: Option<Participant>) -> Self {
        Self { conversation_id, participant, ..Self::default() }
    }

    pub fn binding(&self) -> Option<(&str, &Participant)> {
        match (&self.conversation_id, &self.participant) {
            (Some(conversation_id), Some(participant)) => Some((conversation_id.as_str(), participant)),
            _ => None,
        }
    }

    pub fn messages(&self) -> &[ChatMessageView] {
        &self.messages
    }

    fn local_user_id(&self) -> &str {
        self.participant.as_ref().map(|p| p.user_id.as_str()).unwrap_or_default()
    }

    /// Appends an optimistic entry for `input` and returns the payload to send.
    /// `None` when the body is blank or the session is not bound.
    pub fn compose(&mut self, input: &SendMessageInput) -> Option<MessagePayload> {
        let body = input.body.trim();
        if body.is_empty() {
            return None;
        }
        let (conversation_id, participant) = self.binding()?;
        let temp_id = format!("tmp_{}", Uuid::new_v4().simple());

        let mut message = ChatMessage::sent_by(
            conversation_id,
            participant,
            body,
            input.kind,
            input.metadata.clone(),
            Utc::now()
        );
        message.id = temp_id.clone();

        let payload = MessagePayload {
            conversation_id: conversation_id.to_string(),
            temp_id: Some(temp_id.clone()),
            body: message.body.clone(),
            kind: message.kind,
            metadata: message.metadata.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            sender_avatar_color: message.sender_avatar_color.clone(),
        };
        self.messages.push(ChatMessageView { message, temp_id: Some(temp_id), is_local: true });
        Some(payload)
    }

    /// Folds a server event into the list. Returns true when the list changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::History(history) if self.is_bound_to(&history.conversation_id) => {
                self.replace_history(&history.messages);
                true
            }
            ServerEvent::Message(delivery) if self.is_bound_to(&delivery.conversation_id) => {
                self.reconcile(delivery)
            }
            ServerEvent::MessageStatus(update) if self.is_bound_to(&update.conversation_id) => {
                self.apply_status(update)
            }
            _ => false,
        }
    }

    fn is_bound_to(&self, conversation_id: &str) -> bool {
        self.conversation_id.as_deref() == Some(conversation_id)
    }

    /// Server history wins; optimistic entries that never reached the server stay visible.
    fn replace_history(&mut self, history: &[ChatMessage]) {
        let local_user_id = self.local_user_id().to_string();
        let known: HashSet<&str> = history
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        let unconfirmed: Vec<ChatMessageView> = self.messages
            .drain(..)
            .filter(|m| m.temp_id.as_deref() == Some(m.id()) && !known.contains(m.id()))
            .collect();

        self.messages = history
            .iter()
            .cloned()
            .map(|m| ChatMessageView::from_server(m, &local_user_id))
            .chain(unconfirmed)
            .collect();
        self.sort();
    }

    /// Replaces the optimistic entry matching `temp_id`, or appends a new
    /// message. Redelivery of a message already in the list changes nothing.
    fn reconcile(&mut self, delivery: &MessageDelivery) -> bool {
        let local_user_id = self.local_user_id().to_string();
        let incoming = ChatMessageView {
            is_local: delivery.message.sender_id == local_user_id,
            temp_id: delivery.temp_id.clone(),
            message: delivery.message.clone(),
        };

        let optimistic = delivery.temp_id.as_deref().and_then(|temp_id| {
            self.messages
                .iter()
                .position(|m| m.temp_id.as_deref() == Some(temp_id) || m.id() == temp_id)
        });

        match optimistic {
            Some(pos) if self.messages[pos].id() != incoming.id() => {
                self.messages[pos] = incoming;
                let id = self.messages[pos].message.id.clone();
                let mut seen = false;
                self.messages.retain(|m| {
                    if m.message.id != id {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            _ if self.messages.iter().any(|m| m.id() == incoming.id()) => {
                return false;
            }
            _ => self.messages.push(incoming),
        }
        self.sort();
        true
    }

    fn apply_status(&mut self, update: &StatusUpdate) -> bool {
        self.messages
            .iter_mut()
            .find(|m| m.message.id == update.message_id)
            .map_or(false, |m| m.message.advance_status(update.status, update.at))
    }

    fn sort(&mut self) {
        self.messages.sort_by_key(|m| m.message.created_at);
    }

    /// Ids authored by someone else, not yet read, and not yet acknowledged by this session.
    pub fn unread_from_others(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| !m.is_local && m.message.status != MessageStatus::Read)
            .filter(|m| !self.receipted.contains(m.id()))
            .map(|m| m.message.id.clone())
            .collect()
    }

    pub fn mark_receipted(&mut self, ids: &[String]) {
        self.receipted.extend(ids.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::MessageKind;
    use crate::models::websocket::HistoryPayload;
    use chrono::Duration;

    fn me() -> Participant {
        Participant::new("u1", "Ada", "#111")
    }

    fn them() -> Participant {
        Participant::new("u2", "Sam", "#222")
    }

    fn bound() -> SessionState {
        SessionState::new(Some("c1".into()), Some(me()))
    }

    fn confirmed(payload: &MessagePayload) -> ChatMessage {
        ChatMessage::sent_by(
            "c1",
            &payload.sender(),
            payload.body.clone(),
            payload.kind,
            None,
            Utc::now() + Duration::milliseconds(5)
        )
    }

    #[test]
    fn compose_rejects_blank_and_unbound() {
        let mut state = bound();
        assert!(state.compose(&SendMessageInput::text("   ")).is_none());

        let mut unbound = SessionState::new(None, Some(me()));
        assert!(unbound.compose(&SendMessageInput::text("gm")).is_none());
        assert!(state.messages().is_empty());
    }

    #[test]
    fn compose_adds_optimistic_entry() {
        let mut state = bound();
        let payload = state.compose(&SendMessageInput::text("  gm  ")).unwrap();

        let view = &state.messages()[0];
        assert_eq!(view.message.body, "gm");
        assert_eq!(view.message.status, MessageStatus::Sent);
        assert!(view.is_local);
        assert_eq!(view.temp_id, payload.temp_id);
        assert_eq!(Some(view.id()), payload.temp_id.as_deref());
    }

    #[test]
    fn echo_replaces_optimistic_entry() {
        let mut state = bound();
        let payload = state.compose(&SendMessageInput::text("gm")).unwrap();
        let server = confirmed(&payload);
        let delivery = MessageDelivery {
            conversation_id: "c1".into(),
            message: server.clone(),
            temp_id: payload.temp_id.clone(),
        };

        assert!(state.apply(&ServerEvent::Message(delivery.clone())));
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].id(), server.id);

        // redelivery is a no-op
        assert!(!state.apply(&ServerEvent::Message(delivery)));
        let plain = MessageDelivery { conversation_id: "c1".into(), message: server, temp_id: None };
        assert!(!state.apply(&ServerEvent::Message(plain)));
        assert_eq!(state.messages().len(), 1);
    }

    #[test]
    fn incoming_messages_are_sorted() {
        let mut state = bound();
        let now = Utc::now();
        let later = ChatMessage::sent_by("c1", &them(), "second", MessageKind::Text, None, now + Duration::seconds(2));
        let earlier = ChatMessage::sent_by("c1", &them(), "first", MessageKind::Text, None, now);

        for message in [later, earlier] {
            state.apply(
                &ServerEvent::Message(MessageDelivery { conversation_id: "c1".into(), message, temp_id: None })
            );
        }
        let bodies: Vec<&str> = state
            .messages()
            .iter()
            .map(|m| m.message.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert!(state.messages().iter().all(|m| !m.is_local));
    }

    #[test]
    fn history_keeps_unsent_local_entries() {
        let mut state = bound();
        state.compose(&SendMessageInput::text("typed offline")).unwrap();
        let theirs = ChatMessage::sent_by(
            "c1",
            &them(),
            "hello",
            MessageKind::Text,
            None,
            Utc::now() - Duration::seconds(10)
        );

        state.apply(
            &ServerEvent::History(HistoryPayload { conversation_id: "c1".into(), messages: vec![theirs] })
        );
        let bodies: Vec<&str> = state
            .messages()
            .iter()
            .map(|m| m.message.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["hello", "typed offline"]);
    }

    #[test]
    fn unread_tracking_skips_own_and_receipted() {
        let mut state = bound();
        state.compose(&SendMessageInput::text("mine")).unwrap();
        let theirs = ChatMessage::sent_by("c1", &them(), "theirs", MessageKind::Text, None, Utc::now());
        let id = theirs.id.clone();
        state.apply(
            &ServerEvent::Message(MessageDelivery { conversation_id: "c1".into(), message: theirs, temp_id: None })
        );

        assert_eq!(state.unread_from_others(), vec![id.clone()]);
        state.mark_receipted(&[id.clone()]);
        assert!(state.unread_from_others().is_empty());

        let update = StatusUpdate {
            conversation_id: "c1".into(),
            message_id: id,
            status: MessageStatus::Read,
            at: Utc::now(),
            actor_id: "u1".into(),
        };
        assert!(state.apply(&ServerEvent::MessageStatus(update.clone())));
        assert!(!state.apply(&ServerEvent::MessageStatus(update)));
    }

    #[test]
    fn events_for_other_conversations_are_ignored() {
        let mut state = bound();
        let message = ChatMessage::sent_by("c2", &them(), "psst", MessageKind::Text, None, Utc::now());
        assert!(
            !state.apply(
                &ServerEvent::Message(MessageDelivery { conversation_id: "c2".into(), message, temp_id: None })
            )
        );
        assert!(state.messages().is_empty());
    }
}
