use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single implicit room every message belongs to.
pub const CHAT_ROOM: &str = "chat-room-1";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(MessageId);

string_id_newtype!(UserId);
string_id_newtype!(AttachmentId);

impl AttachmentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

/// Identity of one live transport session. Allocated from a process-wide
/// counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: AttachmentId,
    pub file_name: String,
    pub content_type: String,
}

/// A chat message accepted by the server but not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub user_id: UserId,
    pub room_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub attachment: Option<AttachmentRef>,
}

impl NewMessage {
    /// Builds a message in the default room, stamped with the current time.
    pub fn now(user_id: UserId, text: impl Into<String>, attachment: Option<AttachmentRef>) -> Self {
        Self {
            user_id,
            room_id: CHAT_ROOM.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
            attachment,
        }
    }

    pub fn into_persisted(self, message_id: MessageId) -> ChatMessage {
        ChatMessage {
            message_id,
            user_id: self.user_id,
            room_id: self.room_id,
            text: self.text,
            timestamp: self.timestamp,
            attachment: self.attachment,
        }
    }
}

/// A persisted, immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub room_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub attachment: Option<AttachmentRef>,
}
