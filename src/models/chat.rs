use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Seeker,
    Candidate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub avatar_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
}

impl Participant {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        avatar_color: impl Into<String>
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_color: avatar_color.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: ParticipantRole) -> Self {
        self.role = Some(role);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Voice,
    Gift,
    PortfolioSnippet,
    Challenge,
    Reaction,
    Photo,
}

/// Delivery state of a message. Ordered so that a status only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_color: String,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Builds a freshly sent message with a server-assigned id.
    pub fn sent_by(
        conversation_id: &str,
        sender: &Participant,
        body: impl Into<String>,
        kind: MessageKind,
        metadata: Option<JsonValue>,
        created_at: DateTime<Utc>
    ) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.user_id.clone(),
            sender_name: sender.display_name.clone(),
            sender_avatar_color: sender.avatar_color.clone(),
            body: body.into(),
            kind,
            metadata,
            status: MessageStatus::Sent,
            created_at,
            delivered_at: None,
            read_at: None,
        }
    }

    /// Moves the status forward to `status`, stamping the matching timestamp.
    /// Returns false when the message is already at or past `status`.
    pub fn advance_status(&mut self, status: MessageStatus, at: DateTime<Utc>) -> bool {
        if status <= self.status {
            return false;
        }
        match status {
            MessageStatus::Delivered => {
                self.delivered_at = Some(at);
            }
            MessageStatus::Read => {
                self.delivered_at.get_or_insert(at);
                self.read_at = Some(at);
            }
            MessageStatus::Sent => {}
        }
        self.status = status;
        true
    }
}

/// Client-side projection of a message. Never sent to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageView {
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub is_local: bool,
}

impl ChatMessageView {
    pub fn from_server(message: ChatMessage, local_user_id: &str) -> Self {
        let is_local = message.sender_id == local_user_id;
        Self { message, temp_id: None, is_local }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessageInput {
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

impl SendMessageInput {
    pub fn text(body: impl Into<String>) -> Self {
        Self { body: body.into(), kind: MessageKind::Text, metadata: None }
    }
}
