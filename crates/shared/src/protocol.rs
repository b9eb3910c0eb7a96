use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Attachment, MessageId, MessageKind, MessageStatus, Reaction, ReplySnapshot, UserId},
    error::ApiError,
};

/// Outbound events. Serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage {
        recipient_id: UserId,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<ReplySnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
        /// Server-side id handed out by the upload endpoint, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
    },
    EditMessage {
        message_id: MessageId,
        recipient_id: UserId,
        content: String,
    },
    UnsendMessage {
        message_id: MessageId,
        recipient_id: UserId,
    },
    React {
        message_id: MessageId,
        recipient_id: UserId,
        emoji: String,
    },
    Typing {
        recipient_id: UserId,
        active: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
    },
    Recording {
        recipient_id: UserId,
        active: bool,
    },
    VoiceListening {
        message_id: MessageId,
        sender_id: UserId,
    },
    VoiceListened {
        message_id: MessageId,
        sender_id: UserId,
    },
    VoiceMetadata {
        message_id: MessageId,
        recipient_id: UserId,
        waveform: Vec<f32>,
        duration_secs: f64,
    },
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::UnsendMessage { .. } => "unsend_message",
            Self::React { .. } => "react",
            Self::Typing { .. } => "typing",
            Self::Recording { .. } => "recording",
            Self::VoiceListening { .. } => "voice_listening",
            Self::VoiceListened { .. } => "voice_listened",
            Self::VoiceMetadata { .. } => "voice_metadata",
        }
    }
}

/// A request together with the correlation id its ack will carry.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame<'a> {
    pub ack_id: u64,
    #[serde(flatten)]
    pub request: &'a ClientRequest,
}

/// Server representation of a message, as returned by history and real-time events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub unsent: bool,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_id: u64,
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

fn default_ok() -> bool {
    true
}

/// Inbound events. One variant per event name, each with its required fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageIncoming {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<MessageId>,
        message: MessagePayload,
    },
    StatusChanged {
        message_id: MessageId,
        status: MessageStatus,
    },
    Edited {
        message_id: MessageId,
        content: String,
    },
    Unsent {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
    },
    ReactionChanged {
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
    TypingStarted {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
    },
    TypingStopped {
        sender_id: UserId,
    },
    RecordingStarted {
        sender_id: UserId,
    },
    RecordingStopped {
        sender_id: UserId,
    },
    VoiceListening {
        message_id: MessageId,
        listener_id: UserId,
    },
    VoiceListened {
        message_id: MessageId,
        listener_id: UserId,
    },
    Ack(AckPayload),
    Error(ApiError),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageIncoming { .. } => "message_incoming",
            Self::StatusChanged { .. } => "status_changed",
            Self::Edited { .. } => "edited",
            Self::Unsent { .. } => "unsent",
            Self::ReactionChanged { .. } => "reaction_changed",
            Self::TypingStarted { .. } => "typing_started",
            Self::TypingStopped { .. } => "typing_stopped",
            Self::RecordingStarted { .. } => "recording_started",
            Self::RecordingStopped { .. } => "recording_stopped",
            Self::VoiceListening { .. } => "voice_listening",
            Self::VoiceListened { .. } => "voice_listened",
            Self::Ack(_) => "ack",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: u32,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
