//! Ephemeral peer state for the open conversation: typing, recording, listening.
//!
//! Every indicator clears itself after its expiry unless refreshed. Nothing here
//! is persisted.

use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::domain::{MessageId, UserId};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use crate::config::ClientSettings;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    pub peer: Option<UserId>,
    pub typing: bool,
    pub recording: bool,
    /// Draft preview shared by the peer. Only kept when ghost text is enabled.
    pub ghost_text: Option<String>,
    /// Our voice message the peer is currently playing.
    pub listening_to: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Indicator {
    Typing,
    Recording,
    Listening,
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceExpiry {
    pub typing: Duration,
    pub recording: Duration,
    pub listening: Duration,
}

impl From<&ClientSettings> for PresenceExpiry {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            typing: settings.typing_expiry,
            recording: settings.recording_expiry,
            listening: settings.listening_expiry,
        }
    }
}

#[derive(Default)]
struct PresenceState {
    snapshot: PresenceSnapshot,
    timers: HashMap<Indicator, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl PresenceState {
    fn cancel_all(&mut self) {
        for (_, (_, timer)) in self.timers.drain() {
            timer.abort();
        }
    }

    fn clear(&mut self, indicator: Indicator) {
        if let Some((_, timer)) = self.timers.remove(&indicator) {
            timer.abort();
        }
        match indicator {
            Indicator::Typing => {
                self.snapshot.typing = false;
                self.snapshot.ghost_text = None;
            }
            Indicator::Recording => self.snapshot.recording = false,
            Indicator::Listening => self.snapshot.listening_to = None,
        }
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    state: Arc<Mutex<PresenceState>>,
    published: Arc<watch::Sender<PresenceSnapshot>>,
    expiry: PresenceExpiry,
    ghost_text: bool,
}

impl PresenceTracker {
    pub fn new(expiry: PresenceExpiry, ghost_text: bool) -> Self {
        let (published, _) = watch::channel(PresenceSnapshot::default());
        Self {
            state: Arc::new(Mutex::new(PresenceState::default())),
            published: Arc::new(published),
            expiry,
            ghost_text,
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceSnapshot> {
        self.published.subscribe()
    }

    /// Starts tracking `peer`, dropping whatever was shown for the previous one.
    pub async fn open(&self, peer: UserId) {
        let mut state = self.state.lock().await;
        state.cancel_all();
        state.snapshot = PresenceSnapshot {
            peer: Some(peer),
            ..PresenceSnapshot::default()
        };
        self.publish(&state);
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.cancel_all();
        state.snapshot = PresenceSnapshot::default();
        self.publish(&state);
    }

    pub async fn typing_started(&self, sender: &UserId, preview: Option<String>) {
        let mut state = self.state.lock().await;
        if !Self::is_open_peer(&state, sender) {
            return;
        }
        state.snapshot.typing = true;
        if self.ghost_text {
            // An empty preview means the peer cleared the draft.
            state.snapshot.ghost_text = preview.filter(|text| !text.is_empty());
        }
        self.arm(&mut state, Indicator::Typing);
        self.publish(&state);
    }

    pub async fn typing_stopped(&self, sender: &UserId) {
        self.stop(sender, Indicator::Typing).await;
    }

    pub async fn recording_started(&self, sender: &UserId) {
        let mut state = self.state.lock().await;
        if !Self::is_open_peer(&state, sender) {
            return;
        }
        state.snapshot.recording = true;
        self.arm(&mut state, Indicator::Recording);
        self.publish(&state);
    }

    pub async fn recording_stopped(&self, sender: &UserId) {
        self.stop(sender, Indicator::Recording).await;
    }

    pub async fn listening_started(&self, listener: &UserId, message_id: MessageId) {
        let mut state = self.state.lock().await;
        if !Self::is_open_peer(&state, listener) {
            return;
        }
        state.snapshot.listening_to = Some(message_id);
        self.arm(&mut state, Indicator::Listening);
        self.publish(&state);
    }

    pub async fn listening_finished(&self, listener: &UserId) {
        self.stop(listener, Indicator::Listening).await;
    }

    async fn stop(&self, sender: &UserId, indicator: Indicator) {
        let mut state = self.state.lock().await;
        if !Self::is_open_peer(&state, sender) {
            return;
        }
        state.clear(indicator);
        self.publish(&state);
    }

    fn is_open_peer(state: &PresenceState, sender: &UserId) -> bool {
        let open = state.snapshot.peer.as_ref() == Some(sender);
        if !open {
            debug!(sender = %sender, "presence: ignoring event for another conversation");
        }
        open
    }

    fn arm(&self, state: &mut PresenceState, indicator: Indicator) {
        if let Some((_, timer)) = state.timers.remove(&indicator) {
            timer.abort();
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let expiry = match indicator {
            Indicator::Typing => self.expiry.typing,
            Indicator::Recording => self.expiry.recording,
            Indicator::Listening => self.expiry.listening,
        };

        let tracker = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            tracker.expire(indicator, generation).await;
        });
        state.timers.insert(indicator, (generation, timer));
    }

    async fn expire(&self, indicator: Indicator, generation: u64) {
        let mut state = self.state.lock().await;
        // A refresh or a stop may have raced the timer to the lock.
        if state.timers.get(&indicator).map(|(armed, _)| *armed) != Some(generation) {
            return;
        }
        state.timers.remove(&indicator);
        state.clear(indicator);
        debug!(?indicator, "presence: expired");
        self.publish(&state);
    }

    fn publish(&self, state: &PresenceState) {
        self.published.send_replace(state.snapshot.clone());
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
