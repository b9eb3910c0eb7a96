use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use shared::{
    domain::{ConversationKey, Message, MessageId, MessageStatus, UserId},
    protocol::ClientRequest,
};
use storage::MessageStore;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod audio;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
mod pipeline;
pub mod presence;
mod reconcile;
pub mod transport;

pub use api::{HistoryApi, HttpApi, OutgoingFile, UploadApi};
pub use audio::{AudioCoordinator, AudioSignal};
pub use cache::ConversationCache;
pub use config::ClientSettings;
pub use conversation::ConversationView;
pub use error::{ChatError, ChatResult};
pub use pipeline::VoiceNote;
pub use presence::{PresenceExpiry, PresenceSnapshot, PresenceTracker};
pub use transport::{RealtimeChannel, WebSocketChannel};

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// New contents of the open conversation, oldest first.
    MessagesChanged { peer: UserId, messages: Vec<Message> },
    /// A message was added at the end of the open conversation.
    ScrollToLatest,
    /// Something the user should be told about, e.g. a rejected operation.
    Notice(String),
}

const TOMBSTONE_CAPACITY: usize = 4096;

/// Ids unsent during this session, so late deliveries of them can be dropped.
/// Holds the most recent `capacity` ids.
struct Tombstones {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl Tombstones {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: MessageId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

struct EngineState {
    view: Option<ConversationView>,
    /// Bumped on every open/close so late history responses can be discarded.
    generation: u64,
    tombstones: Tombstones,
    /// Voice metadata waiting for the permanent id of its message, by temporary id.
    pending_voice_notes: HashMap<MessageId, VoiceNote>,
}

impl EngineState {
    /// Drops the open view. Voice notes of its failed sends go with it; a later
    /// retry sends the audio without waveform metadata.
    fn discard_view(&mut self) {
        let Some(view) = self.view.take() else {
            return;
        };
        for message in view.messages() {
            if message.status == MessageStatus::Failed {
                self.pending_voice_notes.remove(&message.id);
            }
        }
    }
}

/// Client-side sync engine for 1:1 conversations.
///
/// All mutations of the open conversation and its cache rows go through one
/// lock, so user actions, acks, history merges and inbound events apply one
/// at a time in arrival order.
pub struct ChatClient {
    settings: ClientSettings,
    local_user: UserId,
    channel: Arc<dyn RealtimeChannel>,
    history: Arc<dyn HistoryApi>,
    uploads: Arc<dyn UploadApi>,
    cache: ConversationCache,
    state: Mutex<EngineState>,
    presence: PresenceTracker,
    audio: AudioCoordinator,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        settings: ClientSettings,
        local_user: UserId,
        channel: Arc<dyn RealtimeChannel>,
        history: Arc<dyn HistoryApi>,
        uploads: Arc<dyn UploadApi>,
        store: Arc<dyn MessageStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let presence = PresenceTracker::new(PresenceExpiry::from(&settings), settings.ghost_text);
        Arc::new(Self {
            audio: AudioCoordinator::new(local_user.clone()),
            settings,
            local_user,
            channel,
            history,
            uploads,
            cache: ConversationCache::new(store),
            state: Mutex::new(EngineState {
                view: None,
                generation: 0,
                tombstones: Tombstones::with_capacity(TOMBSTONE_CAPACITY),
                pending_voice_notes: HashMap::new(),
            }),
            presence,
            events,
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> PresenceSnapshot {
        self.presence.snapshot()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceSnapshot> {
        self.presence.subscribe()
    }

    pub fn active_audio(&self) -> Option<MessageId> {
        self.audio.active()
    }

    pub fn watch_active_audio(&self) -> watch::Receiver<Option<MessageId>> {
        self.audio.watch_active()
    }

    pub fn audio_signals(&self) -> broadcast::Receiver<AudioSignal> {
        self.audio.signals()
    }

    pub async fn open_peer(&self) -> Option<UserId> {
        let state = self.state.lock().await;
        state.view.as_ref().map(|view| view.peer().clone())
    }

    /// Current list of the open conversation, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .view
            .as_ref()
            .map(|view| view.messages().to_vec())
            .unwrap_or_default()
    }

    /// Applies inbound events until the channel goes away.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut inbound = self.channel.subscribe();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(event) => client.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound: fell behind, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("inbound: channel closed");
        })
    }

    /// Shows `peer`'s conversation from the cache right away and refreshes it
    /// from the server in the background.
    ///
    /// The returned handle resolves once the history refresh has been applied
    /// or discarded.
    pub async fn open_conversation(self: &Arc<Self>, peer: UserId) -> JoinHandle<()> {
        self.presence.open(peer.clone()).await;
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.discard_view();
            let key = ConversationKey::between(&self.local_user, &peer);
            let cached = match self.cache.load(&key).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(peer = %peer, %err, "conversation: cache unavailable, starting empty");
                    Vec::new()
                }
            };
            let cached = cached
                .into_iter()
                .filter(|message| !state.tombstones.contains(&message.id))
                .collect();
            let view = ConversationView::new(&self.local_user, peer.clone(), cached);
            self.publish(&view);
            state.view = Some(view);
            state.generation
        };
        let _ = self.events.send(ClientEvent::ScrollToLatest);
        info!(peer = %peer, generation, "conversation: opened");

        let client = Arc::clone(self);
        tokio::spawn(async move { client.sync_history(peer, generation).await })
    }

    pub async fn close_conversation(&self) {
        {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.discard_view();
        }
        self.presence.close().await;
        debug!("conversation: closed");
    }

    /// Marks `message_id` as the one playing. Any other player is told to pause.
    pub async fn set_active_audio(&self, message_id: MessageId, sender_id: UserId) {
        let activation = self
            .audio
            .set_active(message_id.clone(), sender_id.clone())
            .await;
        if activation.report_listening {
            self.emit_best_effort(ClientRequest::VoiceListening {
                message_id,
                sender_id,
            })
            .await;
        }
    }

    /// Playback of `message_id` was paused or its player went away.
    pub async fn clear_active_audio(&self, message_id: &MessageId) {
        self.audio.clear(message_id).await;
    }

    /// Playback of `message_id` reached its end.
    pub async fn audio_ended(&self, message_id: &MessageId) {
        if let Some(sender_id) = self.audio.playback_ended(message_id).await {
            self.emit_best_effort(ClientRequest::VoiceListened {
                message_id: message_id.clone(),
                sender_id,
            })
            .await;
        }
    }

    fn publish(&self, view: &ConversationView) {
        let _ = self.events.send(ClientEvent::MessagesChanged {
            peer: view.peer().clone(),
            messages: view.messages().to_vec(),
        });
    }

    /// Surfaces a failed user operation as a notice before handing it back.
    fn surface<T>(&self, result: ChatResult<T>) -> ChatResult<T> {
        if let Err(err) = &result {
            warn!(%err, "operation rejected");
            let _ = self.events.send(ClientEvent::Notice(err.to_string()));
        }
        result
    }

    fn ensure_connected(&self) -> ChatResult<()> {
        if self.channel.is_connected() {
            Ok(())
        } else {
            Err(ChatError::NotConnected)
        }
    }

    /// Fire-and-forget emit for signals whose loss is harmless.
    async fn emit_best_effort(&self, request: ClientRequest) {
        if !self.channel.is_connected() {
            debug!(request = request.name(), "emit skipped: not connected");
            return;
        }
        let name = request.name();
        if let Err(err) = self.channel.emit(request).await {
            warn!(request = name, %err, "emit failed");
        }
    }
}

/// Cache writes never fail the operation; memory stays authoritative.
fn cache_write<T>(result: anyhow::Result<T>, operation: &'static str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(operation, %err, "cache: write failed");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
