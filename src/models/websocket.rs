use crate::models::chat::{ ChatMessage, MessageKind, MessageStatus, Participant };
use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown event type '{0}'")]
    UnknownType(String),
    #[error("invalid '{event}' payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub conversation_id: String,
    pub participant: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<Participant>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_color: String,
}

impl MessagePayload {
    pub fn sender(&self) -> Participant {
        Participant::new(&self.sender_id, &self.sender_name, &self.sender_avatar_color)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
    pub user_id: String,
}

/// Typing notice; identical in both directions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivery {
    pub conversation_id: String,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub conversation_id: String,
    pub message_id: String,
    pub status: MessageStatus,
    pub at: DateTime<Utc>,
    pub actor_id: String,
}

/// Events sent by a client session to the gateway.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "init")] Init(InitPayload),
    #[serde(rename = "message")] Message(MessagePayload),
    #[serde(rename = "read")] Read(ReadPayload),
    #[serde(rename = "typing")] Typing(TypingPayload),
}

impl ClientEvent {
    const TYPES: &'static [&'static str] = &["init", "message", "read", "typing"];

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        parse_tagged(text, Self::TYPES)
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            ClientEvent::Init(p) => &p.conversation_id,
            ClientEvent::Message(p) => &p.conversation_id,
            ClientEvent::Read(p) => &p.conversation_id,
            ClientEvent::Typing(p) => &p.conversation_id,
        }
    }
}

/// Events pushed by the gateway to every subscribed connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "history")] History(HistoryPayload),
    #[serde(rename = "message")] Message(MessageDelivery),
    #[serde(rename = "message:status")] MessageStatus(StatusUpdate),
    #[serde(rename = "typing")] Typing(TypingPayload),
    #[serde(rename = "ping")]
    Ping,
}

impl ServerEvent {
    const TYPES: &'static [&'static str] = &[
        "history",
        "message",
        "message:status",
        "typing",
        "ping",
    ];

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        parse_tagged(text, Self::TYPES)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parses a `type`-tagged frame, telling apart broken JSON, unknown tags and
/// bad payloads so callers can log each case before dropping it.
fn parse_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, ProtocolError> {
    let value: JsonValue = serde_json::from_str(text)?;
    let event_type = value
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !known.contains(&event_type.as_str()) {
        return Err(ProtocolError::UnknownType(event_type));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        event: event_type,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_init_with_optional_peer() {
        let text = json!({
            "type": "init",
            "conversationId": "c1",
            "participant": { "userId": "u1", "displayName": "Ada", "avatarColor": "#111", "role": "seeker" }
        }).to_string();

        match ClientEvent::parse(&text).unwrap() {
            ClientEvent::Init(init) => {
                assert_eq!(init.conversation_id, "c1");
                assert_eq!(init.participant.user_id, "u1");
                assert!(init.peer.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn message_kind_defaults_to_text() {
        let text = json!({
            "type": "message",
            "conversationId": "c1",
            "tempId": "t1",
            "body": "gm",
            "senderId": "u1",
            "senderName": "Ada",
            "senderAvatarColor": "#111"
        }).to_string();

        match ClientEvent::parse(&text).unwrap() {
            ClientEvent::Message(message) => {
                assert_eq!(message.kind, MessageKind::Text);
                assert_eq!(message.temp_id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn classifies_bad_frames() {
        assert!(matches!(ClientEvent::parse("{not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(ClientEvent::parse("{\"body\":1}"), Err(ProtocolError::MissingType)));
        assert!(
            matches!(ClientEvent::parse("{\"type\":\"dance\"}"), Err(ProtocolError::UnknownType(t)) if t == "dance")
        );
        assert!(
            matches!(
                ClientEvent::parse("{\"type\":\"read\",\"conversationId\":\"c1\"}"),
                Err(ProtocolError::InvalidPayload { .. })
            )
        );
    }

    #[test]
    fn server_events_use_wire_tags() {
        assert_eq!(ServerEvent::Ping.to_json().unwrap(), "{\"type\":\"ping\"}");

        let update = ServerEvent::MessageStatus(StatusUpdate {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            status: MessageStatus::Read,
            at: Utc::now(),
            actor_id: "u2".into(),
        });
        let json: JsonValue = serde_json::from_str(&update.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "message:status");
        assert_eq!(json["status"], "read");
        assert_eq!(json["actorId"], "u2");

        let parsed = ServerEvent::parse(&update.to_json().unwrap()).unwrap();
        assert_eq!(parsed, update);
    }
}
