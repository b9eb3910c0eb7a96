//! Outbound user actions. Sends are shown immediately under a temporary id and
//! confirmed later; edits, unsends and reactions apply locally before the server
//! hears about them.

use chrono::Utc;
use shared::{
    domain::{
        Attachment, Message, MessageId, MessageKind, MessagePatch, MessageStatus, ReplySnapshot,
        UserId,
    },
    protocol::ClientRequest,
};
use tracing::{debug, info};

use crate::{api::OutgoingFile, cache_write, ChatClient, ChatError, ChatResult, ClientEvent};

/// Recording details of a voice note, shared with the recipient once the
/// message has its permanent id.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceNote {
    pub waveform: Vec<f32>,
    pub duration_secs: f64,
}

impl ChatClient {
    /// Sends a text message to the open conversation. Returns its temporary id.
    pub async fn send_text(
        &self,
        content: &str,
        reply_to: Option<ReplySnapshot>,
    ) -> ChatResult<MessageId> {
        let result = self.send_text_inner(content, reply_to).await;
        self.surface(result)
    }

    async fn send_text_inner(
        &self,
        content: &str,
        reply_to: Option<ReplySnapshot>,
    ) -> ChatResult<MessageId> {
        self.ensure_connected()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let peer = self.require_open_peer().await?;
        let message = self.provisional(&peer, content.to_string(), MessageKind::Text, None, reply_to);
        let request = send_request(&message, None);
        self.send_provisional(message, request, None).await
    }

    /// Uploads and sends each file in order. One result per file.
    pub async fn send_attachments(&self, files: Vec<OutgoingFile>) -> Vec<ChatResult<MessageId>> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            let result = self.send_file(file, None).await;
            results.push(self.surface(result));
        }
        results
    }

    pub async fn send_voice_note(&self, file: OutgoingFile, voice: VoiceNote) -> ChatResult<MessageId> {
        let result = self.send_file(file, Some(voice)).await;
        self.surface(result)
    }

    async fn send_file(&self, file: OutgoingFile, voice: Option<VoiceNote>) -> ChatResult<MessageId> {
        self.ensure_connected()?;
        let limit = self.settings.max_upload_bytes;
        let size = file.size();
        if size > limit {
            return Err(ChatError::FileTooLarge {
                name: file.name,
                size,
                limit,
            });
        }
        let peer = self.require_open_peer().await?;
        let kind = if voice.is_some() {
            MessageKind::Audio
        } else {
            MessageKind::from_mime(&file.mime_type)
        };

        let upload = self
            .uploads
            .upload(&file, &peer, kind)
            .await
            .map_err(|err| ChatError::Upload(format!("{}: {err}", file.name)))?;
        info!(file = %file.name, size = file.size(), "send: uploaded attachment");

        let attachment = Attachment {
            file_url: upload.file_url,
            file_name: file.name.clone(),
            file_size: file.size(),
            mime_type: Some(file.mime_type.clone()),
            waveform: voice
                .as_ref()
                .map(|voice| voice.waveform.clone())
                .or(upload.waveform)
                .unwrap_or_default(),
            duration_secs: voice.as_ref().map(|voice| voice.duration_secs),
        };
        let content = placeholder(kind, &file.name);
        let message = self.provisional(&peer, content, kind, Some(attachment), None);
        let request = send_request(&message, upload.message_id);
        self.send_provisional(message, request, voice).await
    }

    /// Re-sends a failed message under a fresh temporary id.
    pub async fn retry(&self, id: &MessageId) -> ChatResult<MessageId> {
        let result = self.retry_inner(id).await;
        self.surface(result)
    }

    async fn retry_inner(&self, id: &MessageId) -> ChatResult<MessageId> {
        self.ensure_connected()?;
        let (failed, voice) = {
            let mut state = self.state.lock().await;
            let Some(view) = state.view.as_mut() else {
                return Err(ChatError::NoOpenConversation);
            };
            let failed = view
                .get(id)
                .cloned()
                .ok_or_else(|| ChatError::UnknownMessage(id.clone()))?;
            if failed.status != MessageStatus::Failed {
                return Err(ChatError::NotRetryable(id.clone()));
            }
            view.remove(id);
            self.publish(view);
            cache_write(self.cache.delete(id).await, "drop failed send");
            (failed, state.pending_voice_notes.remove(id))
        };

        debug!(message_id = %id, "send: retrying");
        let message = self.provisional(
            &failed.recipient_id,
            failed.content,
            failed.kind,
            failed.attachment,
            failed.reply_to,
        );
        let request = send_request(&message, None);
        self.send_provisional(message, request, voice).await
    }

    /// Replaces the text of one of our own messages. Final locally even if the
    /// server later rejects it.
    pub async fn edit_message(&self, id: &MessageId, content: &str) -> ChatResult<()> {
        let result = self.edit_inner(id, content).await;
        self.surface(result)
    }

    async fn edit_inner(&self, id: &MessageId, content: &str) -> ChatResult<()> {
        self.ensure_connected()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }

        let peer = {
            let mut state = self.state.lock().await;
            let Some(view) = state.view.as_mut() else {
                return Err(ChatError::NoOpenConversation);
            };
            let message = view
                .get(id)
                .ok_or_else(|| ChatError::UnknownMessage(id.clone()))?;
            if message.sender_id != self.local_user || message.kind != MessageKind::Text {
                return Err(ChatError::NotEditable);
            }
            if id.is_temporary() {
                return Err(ChatError::MessagePending(id.clone()));
            }
            let patch = MessagePatch::edit(content);
            view.patch(id, &patch);
            self.publish(view);
            cache_write(self.cache.patch(id, &patch).await, "edit");
            view.peer().clone()
        };

        self.emit_confirmed(ClientRequest::EditMessage {
            message_id: id.clone(),
            recipient_id: peer,
            content: content.to_string(),
        })
        .await
    }

    /// Removes one of our own messages for both participants.
    pub async fn unsend(&self, id: &MessageId) -> ChatResult<()> {
        let result = self.unsend_inner(id).await;
        self.surface(result)
    }

    async fn unsend_inner(&self, id: &MessageId) -> ChatResult<()> {
        self.ensure_connected()?;
        let peer = {
            let mut state = self.state.lock().await;
            let peer = {
                let Some(view) = state.view.as_mut() else {
                    return Err(ChatError::NoOpenConversation);
                };
                let message = view
                    .get(id)
                    .ok_or_else(|| ChatError::UnknownMessage(id.clone()))?;
                if message.sender_id != self.local_user {
                    return Err(ChatError::NotOwnMessage);
                }
                if id.is_temporary() {
                    return Err(ChatError::MessagePending(id.clone()));
                }
                view.remove(id);
                self.publish(view);
                view.peer().clone()
            };
            state.tombstones.insert(id.clone());
            cache_write(self.cache.delete(id).await, "unsend");
            peer
        };
        self.audio.clear(id).await;

        self.emit_confirmed(ClientRequest::UnsendMessage {
            message_id: id.clone(),
            recipient_id: peer,
        })
        .await
    }

    /// Adds our `emoji` reaction, or removes it if already present.
    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str) -> ChatResult<()> {
        let result = self.toggle_reaction_inner(id, emoji).await;
        self.surface(result)
    }

    async fn toggle_reaction_inner(&self, id: &MessageId, emoji: &str) -> ChatResult<()> {
        self.ensure_connected()?;
        let peer = {
            let mut state = self.state.lock().await;
            let Some(view) = state.view.as_mut() else {
                return Err(ChatError::NoOpenConversation);
            };
            let message = view
                .get(id)
                .ok_or_else(|| ChatError::UnknownMessage(id.clone()))?;
            if id.is_temporary() {
                return Err(ChatError::MessagePending(id.clone()));
            }
            let patch = MessagePatch::reactions(message.toggled_reactions(emoji, &self.local_user));
            view.patch(id, &patch);
            self.publish(view);
            cache_write(self.cache.patch(id, &patch).await, "react");
            view.peer().clone()
        };

        self.emit_confirmed(ClientRequest::React {
            message_id: id.clone(),
            recipient_id: peer,
            emoji: emoji.to_string(),
        })
        .await
    }

    /// Tells the peer whether we are typing. `draft` is only shared with ghost text on.
    pub async fn set_typing(&self, active: bool, draft: Option<&str>) {
        let Some(peer) = self.open_peer().await else {
            return;
        };
        let preview = if self.settings.ghost_text && active {
            draft.map(str::to_string)
        } else {
            None
        };
        self.emit_best_effort(ClientRequest::Typing {
            recipient_id: peer,
            active,
            preview,
        })
        .await;
    }

    pub async fn set_recording(&self, active: bool) {
        let Some(peer) = self.open_peer().await else {
            return;
        };
        self.emit_best_effort(ClientRequest::Recording {
            recipient_id: peer,
            active,
        })
        .await;
    }

    async fn require_open_peer(&self) -> ChatResult<UserId> {
        self.open_peer().await.ok_or(ChatError::NoOpenConversation)
    }

    fn provisional(
        &self,
        peer: &UserId,
        content: String,
        kind: MessageKind,
        attachment: Option<Attachment>,
        reply_to: Option<ReplySnapshot>,
    ) -> Message {
        let now = Utc::now();
        Message {
            id: MessageId::temporary(now),
            sender_id: self.local_user.clone(),
            recipient_id: peer.clone(),
            content,
            kind,
            status: MessageStatus::Sending,
            timestamp: now,
            attachment,
            reactions: Vec::new(),
            reply_to,
            edited: false,
            unsent: false,
        }
    }

    /// Shows and caches `message`, then emits `request` and folds in the ack.
    async fn send_provisional(
        &self,
        message: Message,
        request: ClientRequest,
        voice: Option<VoiceNote>,
    ) -> ChatResult<MessageId> {
        let temp_id = message.id.clone();
        {
            let mut state = self.state.lock().await;
            if let Some(voice) = voice {
                state.pending_voice_notes.insert(temp_id.clone(), voice);
            }
            if let Some(view) = state
                .view
                .as_mut()
                .filter(|view| view.peer() == &message.recipient_id)
            {
                view.push(message.clone());
                self.publish(view);
            }
            cache_write(self.cache.upsert(&message).await, "store provisional");
        }
        let _ = self.events.send(ClientEvent::ScrollToLatest);
        debug!(temp_id = %temp_id, kind = message.kind.as_str(), "send: provisional shown");

        match self.channel.emit(request).await {
            Ok(Some(ack)) if ack.ok => {
                if let Some(confirmed) = ack.message {
                    self.apply_incoming(Some(temp_id.clone()), confirmed).await;
                }
                Ok(temp_id)
            }
            Ok(Some(ack)) => {
                self.mark_failed(&temp_id).await;
                Err(ChatError::Rejected(rejection_reason(ack.error)))
            }
            Ok(None) => {
                debug!(temp_id = %temp_id, "send: no ack, waiting for the echo");
                Ok(temp_id)
            }
            Err(err) => {
                self.mark_failed(&temp_id).await;
                Err(ChatError::Transport(err))
            }
        }
    }

    async fn mark_failed(&self, temp_id: &MessageId) {
        let mut state = self.state.lock().await;
        let advanced = match state.view.as_mut() {
            Some(view) if view.contains(temp_id) => {
                let advanced = view.advance_status(temp_id, MessageStatus::Failed);
                if advanced {
                    self.publish(view);
                }
                advanced
            }
            _ => true,
        };
        if advanced {
            cache_write(
                self.cache
                    .patch(temp_id, &MessagePatch::status(MessageStatus::Failed))
                    .await,
                "mark failed",
            );
        }
    }

    /// Emits a request whose local effect is already applied. A rejection is
    /// reported but not rolled back.
    async fn emit_confirmed(&self, request: ClientRequest) -> ChatResult<()> {
        let name = request.name();
        match self.channel.emit(request).await {
            Ok(Some(ack)) if !ack.ok => Err(ChatError::Rejected(rejection_reason(ack.error))),
            Ok(_) => {
                debug!(request = name, "emitted");
                Ok(())
            }
            Err(err) => Err(ChatError::Transport(err)),
        }
    }
}

fn send_request(message: &Message, upload_id: Option<String>) -> ClientRequest {
    ClientRequest::SendMessage {
        recipient_id: message.recipient_id.clone(),
        content: message.content.clone(),
        kind: message.kind,
        reply_to: message.reply_to.clone(),
        attachment: message.attachment.clone(),
        upload_id,
    }
}

fn placeholder(kind: MessageKind, file_name: &str) -> String {
    match kind {
        MessageKind::Image => "Photo".to_string(),
        MessageKind::Audio => "Voice message".to_string(),
        MessageKind::Text | MessageKind::File => file_name.to_string(),
    }
}

fn rejection_reason(error: Option<shared::error::ApiError>) -> String {
    error
        .map(|err| err.message)
        .unwrap_or_else(|| "no reason given".to_string())
}
