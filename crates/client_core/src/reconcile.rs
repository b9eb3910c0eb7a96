//! Inbound events and history, folded into the open conversation and the cache.

use chrono::{DateTime, Utc};
use shared::{
    domain::{Message, MessageId, MessagePatch, MessageStatus, UserId},
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use tracing::{debug, warn};

use crate::{
    cache::{confirm_provisional, message_from_payload},
    cache_write,
    conversation::Reconciliation,
    ChatClient, ClientEvent,
};

impl ChatClient {
    pub async fn handle_event(&self, event: ServerEvent) {
        debug!(event = event.name(), "inbound");
        match event {
            ServerEvent::MessageIncoming { temp_id, message } => {
                self.apply_incoming(temp_id, message).await
            }
            ServerEvent::StatusChanged { message_id, status } => {
                self.apply_status(&message_id, status).await
            }
            ServerEvent::Edited {
                message_id,
                content,
            } => {
                self.apply_patch(&message_id, MessagePatch::edit(content))
                    .await
            }
            ServerEvent::ReactionChanged {
                message_id,
                reactions,
            } => {
                self.apply_patch(&message_id, MessagePatch::reactions(reactions))
                    .await
            }
            ServerEvent::Unsent { message_id, .. } => self.apply_unsent(message_id).await,
            ServerEvent::TypingStarted { sender_id, preview } => {
                self.presence.typing_started(&sender_id, preview).await
            }
            ServerEvent::TypingStopped { sender_id } => {
                self.presence.typing_stopped(&sender_id).await
            }
            ServerEvent::RecordingStarted { sender_id } => {
                self.presence.recording_started(&sender_id).await
            }
            ServerEvent::RecordingStopped { sender_id } => {
                self.presence.recording_stopped(&sender_id).await
            }
            ServerEvent::VoiceListening {
                message_id,
                listener_id,
            } => {
                self.presence
                    .listening_started(&listener_id, message_id)
                    .await
            }
            ServerEvent::VoiceListened {
                message_id,
                listener_id,
            } => {
                self.presence.listening_finished(&listener_id).await;
                self.apply_status(&message_id, MessageStatus::Read).await;
            }
            ServerEvent::Ack(ack) => debug!(ack_id = ack.ack_id, "inbound: unclaimed ack"),
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "inbound: server error");
                let _ = self.events.send(ClientEvent::Notice(err.message));
            }
        }
    }

    /// Folds a confirmed or newly received message in. `temp_id` names the
    /// provisional record it confirms, when known.
    pub(crate) async fn apply_incoming(&self, temp_id: Option<MessageId>, payload: MessagePayload) {
        let follow_up = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if payload.unsent || state.tombstones.contains(&payload.id) {
                debug!(message_id = %payload.id, "inbound: dropping unsent message");
                return;
            }

            let now = Utc::now();
            let peer = if payload.sender_id == self.local_user {
                payload.recipient_id.clone()
            } else {
                payload.sender_id.clone()
            };

            let confirmed = match state.view.as_mut().filter(|view| view.peer() == &peer) {
                Some(view) => {
                    let outcome = view.reconcile(temp_id.as_ref(), payload, &self.local_user, now);
                    let confirmed = self.persist_reconciliation(&outcome).await;
                    match outcome {
                        Reconciliation::Duplicate(id) => {
                            debug!(message_id = %id, "inbound: duplicate ignored");
                        }
                        Reconciliation::Appended(_) => {
                            self.publish(view);
                            let _ = self.events.send(ClientEvent::ScrollToLatest);
                        }
                        _ => self.publish(view),
                    }
                    confirmed
                }
                None => self.reconcile_offscreen(temp_id, payload, now).await,
            };

            confirmed.and_then(|(temp_id, message_id)| {
                state
                    .pending_voice_notes
                    .remove(&temp_id)
                    .map(|voice| ClientRequest::VoiceMetadata {
                        message_id,
                        recipient_id: peer,
                        waveform: voice.waveform,
                        duration_secs: voice.duration_secs,
                    })
            })
        };

        if let Some(request) = follow_up {
            self.emit_best_effort(request).await;
        }
    }

    /// Mirrors a reconciliation into the cache. Returns `(temp_id, permanent_id)`
    /// when a provisional record got confirmed.
    async fn persist_reconciliation(
        &self,
        outcome: &Reconciliation,
    ) -> Option<(MessageId, MessageId)> {
        match outcome {
            Reconciliation::Promoted { temp_id, message } => {
                cache_write(self.cache.promote(temp_id, message).await, "promote");
                Some((temp_id.clone(), message.id.clone()))
            }
            Reconciliation::Collapsed {
                temp_id,
                message_id,
            } => {
                cache_write(self.cache.delete(temp_id).await, "collapse provisional");
                Some((temp_id.clone(), message_id.clone()))
            }
            Reconciliation::Duplicate(_) => None,
            Reconciliation::Appended(message) => {
                cache_write(self.cache.upsert(message).await, "store incoming");
                None
            }
        }
    }

    /// A message for a conversation that is not on screen only updates the cache.
    async fn reconcile_offscreen(
        &self,
        temp_id: Option<MessageId>,
        payload: MessagePayload,
        now: DateTime<Utc>,
    ) -> Option<(MessageId, MessageId)> {
        if let Some(temp_id) = temp_id {
            match self.cache.get(&temp_id).await {
                Ok(Some(provisional)) => {
                    let confirmed = confirm_provisional(&provisional, payload);
                    cache_write(self.cache.promote(&temp_id, &confirmed).await, "promote");
                    return Some((temp_id, confirmed.id));
                }
                Ok(None) => {}
                Err(err) => warn!(temp_id = %temp_id, %err, "cache: provisional lookup failed"),
            }
        }

        match self.cache.get(&payload.id).await {
            Ok(Some(_)) => debug!(message_id = %payload.id, "inbound: duplicate ignored"),
            _ => {
                let message = message_from_payload(payload, now);
                cache_write(self.cache.upsert(&message).await, "store incoming");
            }
        }
        None
    }

    async fn apply_status(&self, id: &MessageId, status: MessageStatus) {
        let mut state = self.state.lock().await;
        let advanced = match state.view.as_mut() {
            Some(view) if view.contains(id) => {
                let advanced = view.advance_status(id, status);
                if advanced {
                    self.publish(view);
                }
                advanced
            }
            _ => match self.cache.get(id).await {
                Ok(Some(stored)) => stored.status.can_transition_to(status),
                Ok(None) => false,
                Err(err) => {
                    warn!(message_id = %id, %err, "cache: status lookup failed");
                    false
                }
            },
        };
        if advanced {
            cache_write(
                self.cache.patch(id, &MessagePatch::status(status)).await,
                "status",
            );
        } else {
            debug!(message_id = %id, status = status.as_str(), "inbound: status not applied");
        }
    }

    async fn apply_patch(&self, id: &MessageId, patch: MessagePatch) {
        let mut state = self.state.lock().await;
        if state.tombstones.contains(id) {
            return;
        }
        if let Some(view) = state.view.as_mut() {
            if view.patch(id, &patch) {
                self.publish(view);
            }
        }
        cache_write(self.cache.patch(id, &patch).await, "patch");
    }

    async fn apply_unsent(&self, id: MessageId) {
        {
            let mut state = self.state.lock().await;
            if let Some(view) = state.view.as_mut() {
                if view.remove(&id).is_some() {
                    self.publish(view);
                }
            }
            cache_write(self.cache.delete(&id).await, "unsent");
            state.tombstones.insert(id.clone());
        }
        if self.audio.clear(&id).await {
            debug!(message_id = %id, "audio: stopped unsent message");
        }
    }

    /// Applies a history response, unless the user has moved on since it was requested.
    pub(crate) async fn sync_history(&self, peer: UserId, generation: u64) {
        let payloads = match self
            .history
            .fetch_history(&peer, self.settings.history_limit)
            .await
        {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(peer = %peer, %err, "conversation: history fetch failed, keeping local view");
                return;
            }
        };

        let now = Utc::now();
        let follow_ups = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.generation != generation {
                debug!(peer = %peer, "conversation: discarding stale history");
                return;
            }
            let Some(view) = state.view.as_mut() else {
                return;
            };

            let mut unsent = Vec::new();
            let mut server: Vec<Message> = Vec::with_capacity(payloads.len());
            for payload in payloads {
                if payload.unsent {
                    unsent.push(payload.id);
                } else if !state.tombstones.contains(&payload.id) {
                    server.push(message_from_payload(payload, now));
                }
            }

            cache_write(self.cache.upsert_many(&server).await, "store history");
            let count = server.len();
            let merge = view.merge_history(server);
            let mut dropped = merge.dropped;
            for id in unsent {
                view.remove(&id);
                if !dropped.contains(&id) {
                    dropped.push(id);
                }
            }
            for id in dropped
                .iter()
                .chain(merge.confirmed.iter().map(|(temp_id, _)| temp_id))
            {
                cache_write(self.cache.delete(id).await, "drop stale");
            }
            self.publish(view);
            debug!(
                peer = %peer,
                count,
                dropped = dropped.len(),
                confirmed = merge.confirmed.len(),
                "conversation: history merged"
            );

            merge
                .confirmed
                .into_iter()
                .filter_map(|(temp_id, message_id)| {
                    state
                        .pending_voice_notes
                        .remove(&temp_id)
                        .map(|voice| ClientRequest::VoiceMetadata {
                            message_id,
                            recipient_id: peer.clone(),
                            waveform: voice.waveform,
                            duration_secs: voice.duration_secs,
                        })
                })
                .collect::<Vec<_>>()
        };

        for request in follow_ups {
            self.emit_best_effort(request).await;
        }
    }
}
