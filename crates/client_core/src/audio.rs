//! Single active audio player across all conversations.

use std::{collections::HashSet, sync::Arc};

use shared::domain::{MessageId, UserId};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::debug;

/// Instruction for a player widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSignal {
    Pause(MessageId),
}

/// What activating a player requires of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Activation {
    /// Player that was told to pause.
    pub paused: Option<MessageId>,
    /// Whether the sender should now be told we are listening.
    pub report_listening: bool,
}

#[derive(Default)]
struct AudioState {
    active: Option<(MessageId, UserId)>,
    reported: HashSet<MessageId>,
}

#[derive(Clone)]
pub struct AudioCoordinator {
    local_user: UserId,
    state: Arc<Mutex<AudioState>>,
    active: Arc<watch::Sender<Option<MessageId>>>,
    signals: broadcast::Sender<AudioSignal>,
}

impl AudioCoordinator {
    pub fn new(local_user: UserId) -> Self {
        let (active, _) = watch::channel(None);
        let (signals, _) = broadcast::channel(64);
        Self {
            local_user,
            state: Arc::new(Mutex::new(AudioState::default())),
            active: Arc::new(active),
            signals,
        }
    }

    pub fn active(&self) -> Option<MessageId> {
        self.active.borrow().clone()
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<MessageId>> {
        self.active.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<AudioSignal> {
        self.signals.subscribe()
    }

    /// Makes `message_id` the playing message. The previous one, if any, is paused.
    pub async fn set_active(&self, message_id: MessageId, sender_id: UserId) -> Activation {
        let mut state = self.state.lock().await;
        let mut activation = Activation::default();

        match state.active.take() {
            Some((previous, _)) if previous != message_id => {
                let _ = self.signals.send(AudioSignal::Pause(previous.clone()));
                activation.paused = Some(previous);
            }
            _ => {}
        }

        if sender_id != self.local_user && state.reported.insert(message_id.clone()) {
            activation.report_listening = true;
        }

        debug!(message_id = %message_id, "audio: active");
        state.active = Some((message_id.clone(), sender_id));
        self.active.send_replace(Some(message_id));
        activation
    }

    /// Clears `message_id` if it is the active one (pause or removal). Returns whether it was.
    pub async fn clear(&self, message_id: &MessageId) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(&state.active, Some((active, _)) if active == message_id) {
            return false;
        }
        state.active = None;
        self.active.send_replace(None);
        true
    }

    /// Natural end of playback. Returns the sender to notify, unless it is us.
    pub async fn playback_ended(&self, message_id: &MessageId) -> Option<UserId> {
        let mut state = self.state.lock().await;
        let sender = match state.active.take() {
            Some((active, sender)) if &active == message_id => sender,
            other => {
                state.active = other;
                return None;
            }
        };
        self.active.send_replace(None);
        (sender != self.local_user).then_some(sender)
    }
}

#[cfg(test)]
#[path = "tests/audio_tests.rs"]
mod tests;
