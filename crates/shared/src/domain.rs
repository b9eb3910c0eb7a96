use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TEMPORARY_ID_PREFIX: &str = "temp-";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

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

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

impl MessageId {
    /// Client-side placeholder id used until the server confirms the message.
    pub fn temporary(at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{TEMPORARY_ID_PREFIX}{}-{}",
            at.timestamp_millis(),
            &suffix[..8]
        ))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }
}

/// Order-independent identifier of the thread between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn between(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}:{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    File,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    /// Picks the attachment kind from a MIME type.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            Self::Image
        } else if mime_type.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }
}

/// `sending → sent → delivered → read`, with `failed` reachable only from `sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Sending, Self::Failed) => true,
            (_, Self::Failed) | (Self::Failed, _) => false,
            (current, next) => current.rank() < next.rank(),
        }
    }

    /// The furthest of two statuses along the forward path.
    pub fn furthest(self, other: Self) -> Self {
        if self.can_transition_to(other) && other != Self::Failed {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_url: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waveform: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

/// Denormalized copy of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
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

impl Message {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::between(&self.sender_id, &self.recipient_id)
    }

    /// The participant on the other side of `local_user`.
    pub fn peer_of(&self, local_user: &UserId) -> &UserId {
        if &self.sender_id == local_user {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }

    pub fn snapshot(&self, sender_name: Option<String>) -> ReplySnapshot {
        ReplySnapshot {
            id: self.id.clone(),
            content: self.content.clone(),
            sender_id: self.sender_id.clone(),
            sender_name,
            kind: self.kind,
        }
    }

    /// Reaction set after toggling `(emoji, user_id)`.
    pub fn toggled_reactions(&self, emoji: &str, user_id: &UserId) -> Vec<Reaction> {
        let present = self
            .reactions
            .iter()
            .any(|r| r.emoji == emoji && &r.user_id == user_id);
        if present {
            self.reactions
                .iter()
                .filter(|r| !(r.emoji == emoji && &r.user_id == user_id))
                .cloned()
                .collect()
        } else {
            let mut next = self.reactions.clone();
            next.push(Reaction {
                emoji: emoji.to_string(),
                user_id: user_id.clone(),
            });
            next
        }
    }

    pub fn apply(&mut self, patch: &MessagePatch) {
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(timestamp) = patch.timestamp {
            self.timestamp = timestamp;
        }
        if let Some(attachment) = &patch.attachment {
            self.attachment = Some(attachment.clone());
        }
        if let Some(reactions) = &patch.reactions {
            self.reactions = reactions.clone();
        }
        if let Some(edited) = patch.edited {
            self.edited = edited;
        }
    }
}

/// Partial update of a message; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub timestamp: Option<DateTime<Utc>>,
    pub attachment: Option<Attachment>,
    pub reactions: Option<Vec<Reaction>>,
    pub edited: Option<bool>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn edit(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            edited: Some(true),
            ..Self::default()
        }
    }

    pub fn reactions(reactions: Vec<Reaction>) -> Self {
        Self {
            reactions: Some(reactions),
            ..Self::default()
        }
    }

    /// Every mutable field of `message`.
    pub fn from_message(message: &Message) -> Self {
        Self {
            content: Some(message.content.clone()),
            status: Some(message.status),
            timestamp: Some(message.timestamp),
            attachment: message.attachment.clone(),
            reactions: Some(message.reactions.clone()),
            edited: Some(message.edited),
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
