use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Single,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub id: String,
}

impl Room {
    /// Direct conversation with one user.
    pub fn single(user_id: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Single,
            id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub from: User,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub content: String,
    pub room: Room,
}

/// Server payloads for notifications are loosely shaped, so every field is
/// optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionNotification {
    pub id: Option<String>,
    pub from_username: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LikeNotification {
    pub from_username: Option<String>,
    pub post_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageNotification {
    pub from_username: Option<String>,
    pub message_preview: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notice {
    pub message: String,
}

/// Every event the server may push, tagged by its wire name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:message")]
    MessageReceived(ChatMessage),
    #[serde(rename = "chat:messages")]
    MessageHistory(Vec<ChatMessage>),
    #[serde(rename = "notification:connection_request")]
    ConnectionRequest(ConnectionNotification),
    #[serde(rename = "notification:like")]
    Like(LikeNotification),
    #[serde(rename = "notification:message")]
    MessageAlert(MessageNotification),
    #[serde(rename = "notification:security")]
    Security(Notice),
    #[serde(rename = "error")]
    Error(Notice),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::MessageHistory(_) => EventKind::MessageHistory,
            Self::ConnectionRequest(_) => EventKind::ConnectionRequest,
            Self::Like(_) => EventKind::Like,
            Self::MessageAlert(_) => EventKind::MessageAlert,
            Self::Security(_) => EventKind::Security,
            Self::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "chat:join")]
    JoinRoom(Room),
    #[serde(rename = "chat:message")]
    SendMessage(OutgoingMessage),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "chat:join",
            Self::SendMessage(_) => "chat:message",
        }
    }
}

/// Handler registration key: which server event a handler listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    MessageHistory,
    ConnectionRequest,
    Like,
    MessageAlert,
    Security,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::MessageReceived,
        Self::MessageHistory,
        Self::ConnectionRequest,
        Self::Like,
        Self::MessageAlert,
        Self::Security,
        Self::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::MessageReceived => "chat:message",
            Self::MessageHistory => "chat:messages",
            Self::ConnectionRequest => "notification:connection_request",
            Self::Like => "notification:like",
            Self::MessageAlert => "notification:message",
            Self::Security => "notification:security",
            Self::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ack {
    pub id: u64,
    #[serde(default)]
    pub data: Value,
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Event(ServerEvent),
    Ack(Ack),
    /// Well-formed frame carrying an event nobody registered a type for.
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

pub const ACK_EVENT: &str = "ack";

/// Encodes `{"event", "data"}` plus an `ack` id when a reply is wanted.
pub fn encode_client(event: &ClientEvent, ack: Option<u64>) -> Result<String, serde_json::Error> {
    let mut frame = serde_json::to_value(event)?;
    if let (Some(id), Value::Object(map)) = (ack, &mut frame) {
        map.insert("ack".into(), Value::from(id));
    }
    serde_json::to_string(&frame)
}

pub fn decode_frame(text: &str) -> Result<Incoming, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.event == ACK_EVENT {
        return Ok(Incoming::Ack(serde_json::from_value(envelope.data)?));
    }
    if EventKind::from_name(&envelope.event).is_none() {
        return Ok(Incoming::Unknown(envelope.event));
    }

    let tagged = serde_json::json!({ "event": envelope.event, "data": envelope.data });
    Ok(Incoming::Event(serde_json::from_value(tagged)?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_frames_match_wire_shape() {
        let join = encode_client(&ClientEvent::JoinRoom(Room::single("u2")), None).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&join).unwrap(),
            json!({"event": "chat:join", "data": {"type": "single", "id": "u2"}})
        );

        let send = ClientEvent::SendMessage(OutgoingMessage {
            content: "hi".into(),
            room: Room::single("u2"),
        });
        let framed = encode_client(&send, Some(7)).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&framed).unwrap(),
            json!({
                "event": "chat:message",
                "data": {"content": "hi", "room": {"type": "single", "id": "u2"}},
                "ack": 7
            })
        );
    }

    #[test]
    fn decodes_chat_message() {
        let frame = json!({
            "event": "chat:message",
            "data": {
                "id": "m1",
                "content": "hello",
                "from": {"id": "u1", "username": "ada"},
                "createdAt": "2026-03-01T10:00:00Z"
            }
        })
        .to_string();

        let Incoming::Event(ServerEvent::MessageReceived(message)) = decode_frame(&frame).unwrap()
        else {
            panic!("expected chat message");
        };
        assert_eq!(message.from.username, "ada");
    }

    #[test]
    fn connection_request_tolerates_sparse_payload() {
        let frame = r#"{"event":"notification:connection_request","data":{"fromUsername":"bob"}}"#;
        let incoming = decode_frame(frame).unwrap();
        assert_eq!(
            incoming,
            Incoming::Event(ServerEvent::ConnectionRequest(ConnectionNotification {
                from_username: Some("bob".into()),
                ..Default::default()
            }))
        );
    }

    #[test]
    fn ack_and_unknown_frames() {
        assert_eq!(
            decode_frame(r#"{"event":"ack","data":{"id":3,"data":{"ok":true}}}"#).unwrap(),
            Incoming::Ack(Ack {
                id: 3,
                data: json!({"ok": true})
            })
        );
        assert_eq!(
            decode_frame(r#"{"event":"presence:update","data":{}}"#).unwrap(),
            Incoming::Unknown("presence:update".into())
        );
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn event_names_round_trip_through_kind() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
    }
}
