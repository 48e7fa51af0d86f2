use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, UserId};

/// Payload kind of a chat message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    /// Image and file content is stored as a relative media path and must be
    /// expanded to an absolute URL before it goes out on the wire.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::File)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Inbound frames, one JSON object per logical event. The tag set is closed:
/// an unrecognized tag fails to parse and the connection is torn down rather
/// than the frame being silently ignored.
///
/// No frame carries a sender identity; the sender is always the connection's
/// authenticated user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "message")]
    Message {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        message_type: MessageType,
    },

    #[serde(rename = "read")]
    Read { conversation_id: ConversationId },

    #[serde(rename = "typing")]
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

/// Outbound frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Sent once, to a newly registered connection. Never includes the
    /// recipient itself.
    #[serde(rename = "online_users")]
    OnlineUsers { users: Vec<UserId>, timestamp: i64 },

    #[serde(rename = "status")]
    Status {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: i64,
    },

    #[serde(rename = "message")]
    Message {
        conversation_id: ConversationId,
        sender_id: UserId,
        content: String,
        message_type: MessageType,
        timestamp: i64,
    },

    #[serde(rename = "read")]
    Read {
        conversation_id: ConversationId,
        reader_id: UserId,
        timestamp: i64,
    },

    #[serde(rename = "typing")]
    Typing {
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

impl ServerFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::OnlineUsers { .. } => "online_users",
            Self::Status { .. } => "status",
            Self::Message { .. } => "message",
            Self::Read { .. } => "read",
            Self::Typing { .. } => "typing",
        }
    }
}
