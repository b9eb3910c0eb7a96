//! Translation between display messages, wire payloads and persisted rows.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationKey, Message, MessageId, MessagePatch, MessageKind, MessageStatus},
    protocol::MessagePayload,
};
use storage::{MessageStore, RenameOutcome, StoredMessage, StoredMessagePatch};
use tracing::warn;

#[derive(Clone)]
pub struct ConversationCache {
    store: Arc<dyn MessageStore>,
}

impl ConversationCache {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Messages of one conversation, oldest first. Undecodable rows are skipped.
    pub async fn load(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let rows = self.store.load(key).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match from_stored(row) {
                    Ok(message) => Some(message),
                    Err(err) => {
                        warn!(message_id = %id, %err, "cache: skipping undecodable row");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        self.store.get(id).await?.map(from_stored).transpose()
    }

    pub async fn upsert(&self, message: &Message) -> Result<()> {
        self.store.upsert(&to_stored(message)?).await
    }

    pub async fn upsert_many(&self, messages: &[Message]) -> Result<()> {
        let rows = messages.iter().map(to_stored).collect::<Result<Vec<_>>>()?;
        self.store.upsert_many(&rows).await
    }

    pub async fn patch(&self, id: &MessageId, patch: &MessagePatch) -> Result<bool> {
        self.store.patch(id, &to_stored_patch(patch)?).await
    }

    /// Moves the provisional row `old_id` onto the confirmed message's id.
    pub async fn promote(&self, old_id: &MessageId, confirmed: &Message) -> Result<RenameOutcome> {
        let patch = to_stored_patch(&MessagePatch::from_message(confirmed))?;
        let outcome = self.store.rename_id(old_id, &confirmed.id, &patch).await?;
        if outcome == RenameOutcome::Missing {
            self.upsert(confirmed).await?;
        }
        Ok(outcome)
    }

    pub async fn delete(&self, id: &MessageId) -> Result<bool> {
        self.store.delete(id).await
    }
}

pub fn to_stored(message: &Message) -> Result<StoredMessage> {
    Ok(StoredMessage {
        id: message.id.clone(),
        conversation_key: message.conversation_key(),
        sender_id: message.sender_id.0.clone(),
        recipient_id: message.recipient_id.0.clone(),
        content: message.content.clone(),
        kind: message.kind.as_str().to_string(),
        status: message.status.as_str().to_string(),
        created_at: message.timestamp,
        attachment_json: message
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        reactions_json: serde_json::to_string(&message.reactions)?,
        reply_to_json: message
            .reply_to
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        edited: message.edited,
        unsent: message.unsent,
    })
}

pub fn from_stored(row: StoredMessage) -> Result<Message> {
    let kind = MessageKind::parse(&row.kind).ok_or_else(|| anyhow!("unknown kind '{}'", row.kind))?;
    let status = MessageStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("unknown status '{}'", row.status))?;
    Ok(Message {
        id: row.id,
        sender_id: row.sender_id.into(),
        recipient_id: row.recipient_id.into(),
        content: row.content,
        kind,
        status,
        timestamp: row.created_at,
        attachment: row
            .attachment_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("attachment column")?,
        reactions: serde_json::from_str(&row.reactions_json).context("reactions column")?,
        reply_to: row
            .reply_to_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("reply_to column")?,
        edited: row.edited,
        unsent: row.unsent,
    })
}

fn to_stored_patch(patch: &MessagePatch) -> Result<StoredMessagePatch> {
    Ok(StoredMessagePatch {
        content: patch.content.clone(),
        status: patch.status.map(|status| status.as_str().to_string()),
        created_at: patch.timestamp,
        attachment_json: patch
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        reactions_json: patch
            .reactions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        edited: patch.edited,
    })
}

/// Display message for a server payload. Missing server fields fall back to
/// `now` (timestamp) and `sent` (status).
pub fn message_from_payload(payload: MessagePayload, now: DateTime<Utc>) -> Message {
    Message {
        id: payload.id,
        sender_id: payload.sender_id,
        recipient_id: payload.recipient_id,
        content: payload.content,
        kind: payload.kind,
        status: payload.status.unwrap_or(MessageStatus::Sent),
        timestamp: payload.timestamp.unwrap_or(now),
        attachment: payload.attachment,
        reactions: payload.reactions,
        reply_to: payload.reply_to,
        edited: payload.edited,
        unsent: payload.unsent,
    }
}

/// Confirmed version of a provisional record: server fields win, local ones fill gaps.
pub fn confirm_provisional(provisional: &Message, payload: MessagePayload) -> Message {
    let status = payload
        .status
        .map_or(MessageStatus::Sent, |status| MessageStatus::Sent.furthest(status));
    Message {
        id: payload.id,
        sender_id: payload.sender_id,
        recipient_id: payload.recipient_id,
        content: if payload.content.is_empty() {
            provisional.content.clone()
        } else {
            payload.content
        },
        kind: payload.kind,
        status,
        timestamp: payload.timestamp.unwrap_or(provisional.timestamp),
        attachment: payload.attachment.or_else(|| provisional.attachment.clone()),
        reactions: payload.reactions,
        reply_to: payload.reply_to.or_else(|| provisional.reply_to.clone()),
        edited: payload.edited,
        unsent: payload.unsent,
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
