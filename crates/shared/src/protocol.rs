use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::{ChatMessage, UserId},
    error::ApiError,
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A chat frame as sent by a client. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub text: String,
    /// Base64 encoded attachment bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid chat json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("file_data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("binary frame is not utf-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
}

/// An inbound frame after validation. The claimed author is kept only so the
/// session can compare it against the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub claimed_user_id: String,
    pub text: String,
    pub attachment: Option<AttachmentUpload>,
}

impl InboundFrame {
    pub fn decode(raw: &str) -> Result<DecodedFrame, FrameError> {
        let frame: InboundFrame = serde_json::from_str(raw)?;
        frame.into_decoded()
    }

    pub fn decode_bytes(raw: &[u8]) -> Result<DecodedFrame, FrameError> {
        let text = std::str::from_utf8(raw).map_err(|_| FrameError::NotUtf8)?;
        Self::decode(text)
    }

    fn into_decoded(self) -> Result<DecodedFrame, FrameError> {
        let bytes = match self.file_data.as_deref().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => STANDARD.decode(encoded)?,
            _ => Vec::new(),
        };
        let attachment = (!bytes.is_empty()).then(|| AttachmentUpload {
            bytes,
            file_name: self.file_name,
            content_type: if self.file_type.trim().is_empty() {
                DEFAULT_CONTENT_TYPE.to_string()
            } else {
                self.file_type
            },
        });
        Ok(DecodedFrame {
            claimed_user_id: self.user_id,
            text: self.text,
            attachment,
        })
    }
}

/// A chat frame as emitted by the server, for both history replay and live
/// broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub user_id: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
}

impl From<&ChatMessage> for OutboundFrame {
    fn from(message: &ChatMessage) -> Self {
        let (file_id, file_name, file_type) = match &message.attachment {
            Some(attachment) => (
                attachment.attachment_id.0.clone(),
                attachment.file_name.clone(),
                attachment.content_type.clone(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        Self {
            user_id: message.user_id.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
            file_id,
            file_name,
            file_type,
        }
    }
}

/// Sent only to the client whose inbound message was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: ApiError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttachmentId, AttachmentRef, MessageId, CHAT_ROOM};

    #[test]
    fn decodes_plain_text_frame() {
        let decoded = InboundFrame::decode(r#"{"user_id":"alice","text":"hi"}"#).expect("decode");
        assert_eq!(decoded.claimed_user_id, "alice");
        assert_eq!(decoded.text, "hi");
        assert!(decoded.attachment.is_none());
    }

    #[test]
    fn decodes_attachment_bytes_from_base64() {
        let raw = serde_json::json!({
            "user_id": "alice",
            "text": "",
            "file_data": STANDARD.encode(b"\x00\x01binary"),
            "file_name": "blob.bin",
            "file_type": "application/x-test",
        })
        .to_string();
        let decoded = InboundFrame::decode(&raw).expect("decode");
        let attachment = decoded.attachment.expect("attachment");
        assert_eq!(attachment.bytes, b"\x00\x01binary");
        assert_eq!(attachment.file_name, "blob.bin");
        assert_eq!(attachment.content_type, "application/x-test");
    }

    #[test]
    fn empty_file_data_means_no_attachment() {
        let decoded =
            InboundFrame::decode(r#"{"text":"x","file_data":"","file_name":"a.txt"}"#).expect("decode");
        assert!(decoded.attachment.is_none());
        assert_eq!(decoded.claimed_user_id, "");
    }

    #[test]
    fn missing_file_type_defaults_to_octet_stream() {
        let raw = format!(r#"{{"file_data":"{}"}}"#, STANDARD.encode(b"abc"));
        let decoded = InboundFrame::decode(&raw).expect("decode");
        assert_eq!(
            decoded.attachment.expect("attachment").content_type,
            DEFAULT_CONTENT_TYPE
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            InboundFrame::decode("{not json"),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            InboundFrame::decode(r#"{"file_data":"***"}"#),
            Err(FrameError::Base64(_))
        ));
        assert!(matches!(
            InboundFrame::decode_bytes(&[0xff, 0xfe]),
            Err(FrameError::NotUtf8)
        ));
    }

    #[test]
    fn outbound_frame_uses_empty_strings_without_attachment() {
        let message = ChatMessage {
            message_id: MessageId(1),
            user_id: UserId::from("alice"),
            room_id: CHAT_ROOM.to_string(),
            text: "hi".into(),
            timestamp: Utc::now(),
            attachment: None,
        };
        let value = serde_json::to_value(OutboundFrame::from(&message)).expect("json");
        assert_eq!(value["user_id"], "alice");
        assert_eq!(value["file_id"], "");
        assert_eq!(value["file_name"], "");
        assert_eq!(value["file_type"], "");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn outbound_frame_carries_attachment_reference() {
        let message = ChatMessage {
            message_id: MessageId(2),
            user_id: UserId::from("bob"),
            room_id: CHAT_ROOM.to_string(),
            text: String::new(),
            timestamp: Utc::now(),
            attachment: Some(AttachmentRef {
                attachment_id: AttachmentId::from("abc123"),
                file_name: "cat.png".into(),
                content_type: "image/png".into(),
            }),
        };
        let frame = OutboundFrame::from(&message);
        assert_eq!(frame.file_id, "abc123");
        assert_eq!(frame.file_name, "cat.png");
        assert_eq!(frame.file_type, "image/png");
    }
}
