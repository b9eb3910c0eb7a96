use super::*;

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{MessageKind, MessageStatus, ReplySnapshot},
    error::{ApiError, ErrorCode},
    protocol::{AckPayload, MessagePayload, ServerEvent, UploadResponse},
};
use storage::{RenameOutcome, Storage, StoredMessage, StoredMessagePatch};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Confirm,
    Silent,
    Reject,
    Fail,
}

struct TestChannel {
    connected: AtomicBool,
    mode: std::sync::Mutex<AckMode>,
    emitted: std::sync::Mutex<Vec<ClientRequest>>,
    next_ack_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
}

impl TestChannel {
    fn new(mode: AckMode) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            mode: std::sync::Mutex::new(mode),
            emitted: std::sync::Mutex::new(Vec::new()),
            next_ack_id: AtomicU64::new(1),
            events,
        })
    }

    fn set_mode(&self, mode: AckMode) {
        *self.mode.lock().expect("mode") = mode;
    }

    fn emitted(&self) -> Vec<ClientRequest> {
        self.emitted.lock().expect("emitted").clone()
    }

    fn emitted_named(&self, name: &str) -> Vec<ClientRequest> {
        self.emitted()
            .into_iter()
            .filter(|request| request.name() == name)
            .collect()
    }
}

#[async_trait]
impl RealtimeChannel for TestChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, request: ClientRequest) -> Result<Option<AckPayload>> {
        self.emitted.lock().expect("emitted").push(request.clone());
        let ack_id = self.next_ack_id.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().expect("mode");
        match mode {
            AckMode::Confirm => {
                let message = match request {
                    ClientRequest::SendMessage {
                        recipient_id,
                        content,
                        kind,
                        reply_to,
                        attachment,
                        ..
                    } => Some(MessagePayload {
                        id: MessageId::new(format!("ack-{ack_id}")),
                        sender_id: me(),
                        recipient_id,
                        content,
                        kind,
                        status: Some(MessageStatus::Sent),
                        timestamp: None,
                        attachment,
                        reactions: Vec::new(),
                        reply_to,
                        edited: false,
                        unsent: false,
                    }),
                    _ => None,
                };
                Ok(Some(AckPayload {
                    ack_id,
                    ok: true,
                    message,
                    error: None,
                }))
            }
            AckMode::Silent => Ok(None),
            AckMode::Reject => Ok(Some(AckPayload {
                ack_id,
                ok: false,
                message: None,
                error: Some(ApiError::new(ErrorCode::Validation, "blocked")),
            })),
            AckMode::Fail => Err(anyhow!("socket closed")),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct TestApi {
    history: std::sync::Mutex<HashMap<UserId, Vec<MessagePayload>>>,
    gates: std::sync::Mutex<HashMap<UserId, oneshot::Receiver<()>>>,
    fail_history: AtomicBool,
    uploads: std::sync::Mutex<Vec<String>>,
    failing_upload: std::sync::Mutex<Option<String>>,
}

impl TestApi {
    fn set_history(&self, peer: &UserId, messages: Vec<MessagePayload>) {
        self.history
            .lock()
            .expect("history")
            .insert(peer.clone(), messages);
    }

    fn gate(&self, peer: &UserId) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().expect("gates").insert(peer.clone(), rx);
        tx
    }

    fn uploads(&self) -> Vec<String> {
        self.uploads.lock().expect("uploads").clone()
    }
}

#[async_trait]
impl HistoryApi for TestApi {
    async fn fetch_history(&self, peer: &UserId, _limit: u32) -> Result<Vec<MessagePayload>> {
        let gate = self.gates.lock().expect("gates").remove(peer);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            bail!("history unavailable");
        }
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(peer)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl UploadApi for TestApi {
    async fn upload(
        &self,
        file: &OutgoingFile,
        _recipient: &UserId,
        _kind: MessageKind,
    ) -> Result<UploadResponse> {
        self.uploads.lock().expect("uploads").push(file.name.clone());
        if self.failing_upload.lock().expect("failing").as_deref() == Some(file.name.as_str()) {
            bail!("storage full");
        }
        Ok(UploadResponse {
            file_url: format!("https://cdn.example/{}", file.name),
            message_id: None,
            waveform: None,
        })
    }
}

struct BrokenStore;

#[async_trait]
impl MessageStore for BrokenStore {
    async fn load(&self, _: &ConversationKey) -> Result<Vec<StoredMessage>> {
        bail!("disk unavailable")
    }
    async fn get(&self, _: &MessageId) -> Result<Option<StoredMessage>> {
        bail!("disk unavailable")
    }
    async fn upsert(&self, _: &StoredMessage) -> Result<()> {
        bail!("disk unavailable")
    }
    async fn upsert_many(&self, _: &[StoredMessage]) -> Result<()> {
        bail!("disk unavailable")
    }
    async fn patch(&self, _: &MessageId, _: &StoredMessagePatch) -> Result<bool> {
        bail!("disk unavailable")
    }
    async fn rename_id(
        &self,
        _: &MessageId,
        _: &MessageId,
        _: &StoredMessagePatch,
    ) -> Result<RenameOutcome> {
        bail!("disk unavailable")
    }
    async fn delete(&self, _: &MessageId) -> Result<bool> {
        bail!("disk unavailable")
    }
}

fn me() -> UserId {
    UserId::from("me")
}

fn bo() -> UserId {
    UserId::from("bo")
}

fn cy() -> UserId {
    UserId::from("cy")
}

fn settings() -> ClientSettings {
    ClientSettings {
        max_upload_bytes: 1024,
        ..ClientSettings::default()
    }
}

struct Harness {
    client: Arc<ChatClient>,
    channel: Arc<TestChannel>,
    api: Arc<TestApi>,
    storage: Arc<Storage>,
}

impl Harness {
    async fn new(mode: AckMode) -> Self {
        Self::with_settings(mode, settings()).await
    }

    async fn with_settings(mode: AckMode, settings: ClientSettings) -> Self {
        let channel = TestChannel::new(mode);
        let api = Arc::new(TestApi::default());
        let storage = Arc::new(Storage::new("sqlite::memory:").await.expect("db"));
        let client = ChatClient::new(
            settings,
            me(),
            channel.clone(),
            api.clone(),
            api.clone(),
            storage.clone(),
        );
        Self {
            client,
            channel,
            api,
            storage,
        }
    }

    async fn open(&self, peer: UserId) {
        self.client
            .open_conversation(peer)
            .await
            .await
            .expect("history task");
    }

    async fn cached_ids(&self, peer: &UserId) -> Vec<String> {
        self.storage
            .load(&ConversationKey::between(&me(), peer))
            .await
            .expect("load")
            .into_iter()
            .map(|row| row.id.0)
            .collect()
    }

    async fn ids(&self) -> Vec<String> {
        self.client
            .messages()
            .await
            .into_iter()
            .map(|message| message.id.0)
            .collect()
    }
}

fn incoming(id: &str, sender: UserId, recipient: UserId, content: &str) -> ServerEvent {
    ServerEvent::MessageIncoming {
        temp_id: None,
        message: payload(id, sender, recipient, content),
    }
}

fn payload(id: &str, sender: UserId, recipient: UserId, content: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        sender_id: sender,
        recipient_id: recipient,
        content: content.into(),
        kind: MessageKind::Text,
        status: None,
        timestamp: None,
        attachment: None,
        reactions: Vec::new(),
        reply_to: None,
        edited: false,
        unsent: false,
    }
}

fn drain_notices(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<String> {
    let mut notices = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Notice(text) = event {
            notices.push(text);
        }
    }
    notices
}

#[tokio::test]
async fn send_shows_provisional_then_confirms_from_ack() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    let mut events = h.client.subscribe_events();

    let temp_id = h.client.send_text("  hello  ", None).await.expect("send");
    assert!(temp_id.is_temporary());

    let mut lists = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::MessagesChanged { messages, .. } = event {
            lists.push(messages);
        }
    }
    assert_eq!(lists.first().map(|l| l[0].id.clone()), Some(temp_id.clone()));
    assert_eq!(lists[0][0].status, MessageStatus::Sending);

    let messages = h.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].id.is_temporary());
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(h.cached_ids(&bo()).await, vec![messages[0].id.0.clone()]);
}

#[tokio::test]
async fn echo_without_ack_confirms_the_pending_send() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    h.client.send_text("ok", None).await.expect("send");
    h.client.send_text("ok", None).await.expect("send");
    let before = h.ids().await;

    h.client
        .handle_event(incoming("srv-1", me(), bo(), "ok"))
        .await;
    h.client
        .handle_event(incoming("srv-1", me(), bo(), "ok"))
        .await;

    let after = h.ids().await;
    assert_eq!(after, vec!["srv-1".to_string(), before[1].clone()]);
    assert_eq!(h.cached_ids(&bo()).await.len(), 2);
}

#[tokio::test]
async fn ack_and_echo_never_duplicate() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client.send_text("hi", None).await.expect("send");
    let confirmed = h.ids().await;

    let event = incoming(&confirmed[0], me(), bo(), "hi");
    h.client.handle_event(event.clone()).await;
    h.client.handle_event(event).await;

    assert_eq!(h.ids().await, confirmed);
    assert_eq!(h.cached_ids(&bo()).await, confirmed);
}

#[tokio::test]
async fn disconnected_send_is_rejected_without_insertion() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.channel.connected.store(false, Ordering::SeqCst);
    let mut events = h.client.subscribe_events();

    let result = h.client.send_text("hello", None).await;

    assert!(matches!(result, Err(ChatError::NotConnected)));
    assert!(h.client.messages().await.is_empty());
    assert!(h.channel.emitted().is_empty());
    assert_eq!(drain_notices(&mut events).len(), 1);
}

#[tokio::test]
async fn blank_text_and_missing_conversation_are_rejected() {
    let h = Harness::new(AckMode::Confirm).await;
    assert!(matches!(
        h.client.send_text("hi", None).await,
        Err(ChatError::NoOpenConversation)
    ));
    h.open(bo()).await;
    assert!(matches!(
        h.client.send_text("   ", None).await,
        Err(ChatError::EmptyContent)
    ));
    assert!(h.channel.emitted().is_empty());
}

#[tokio::test]
async fn rejected_send_fails_and_retry_resends() {
    let h = Harness::new(AckMode::Reject).await;
    h.open(bo()).await;

    let result = h.client.send_text("hello", None).await;
    assert!(matches!(result, Err(ChatError::Rejected(ref reason)) if reason == "blocked"));
    let failed = h.client.messages().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, MessageStatus::Failed);

    h.channel.set_mode(AckMode::Confirm);
    let new_temp = h.client.retry(&failed[0].id).await.expect("retry");
    assert_ne!(new_temp, failed[0].id);

    let messages = h.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(h.channel.emitted_named("send_message").len(), 2);
    assert_eq!(h.cached_ids(&bo()).await, vec![messages[0].id.0.clone()]);
}

#[tokio::test]
async fn transport_failure_marks_failed_and_only_failed_can_retry() {
    let h = Harness::new(AckMode::Fail).await;
    h.open(bo()).await;
    assert!(matches!(
        h.client.send_text("hello", None).await,
        Err(ChatError::Transport(_))
    ));
    let failed = h.client.messages().await;
    assert_eq!(failed[0].status, MessageStatus::Failed);

    h.channel.set_mode(AckMode::Confirm);
    h.client.send_text("second", None).await.expect("send");
    let sent = h.client.messages().await[1].id.clone();
    assert!(matches!(
        h.client.retry(&sent).await,
        Err(ChatError::NotRetryable(_))
    ));
}

#[tokio::test]
async fn edit_applies_locally_and_stays_after_rejection() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client.send_text("helo", None).await.expect("send");
    let id = h.client.messages().await[0].id.clone();

    h.channel.set_mode(AckMode::Reject);
    let mut events = h.client.subscribe_events();
    let result = h.client.edit_message(&id, "hello").await;
    assert!(matches!(result, Err(ChatError::Rejected(_))));
    assert_eq!(drain_notices(&mut events).len(), 1);

    let message = h.client.messages().await.remove(0);
    assert_eq!(message.content, "hello");
    assert!(message.edited);
    let cached = h.storage.get(&id).await.expect("get").expect("row");
    assert_eq!(cached.content, "hello");
    assert!(cached.edited);
    assert_eq!(
        h.channel.emitted_named("edit_message"),
        vec![ClientRequest::EditMessage {
            message_id: id,
            recipient_id: bo(),
            content: "hello".into(),
        }]
    );
}

#[tokio::test]
async fn edit_rules() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-9", bo(), me(), "theirs"))
        .await;
    let pending = h.client.send_text("mine", None).await.expect("send");

    assert!(matches!(
        h.client.edit_message(&MessageId::from("srv-9"), "x").await,
        Err(ChatError::NotEditable)
    ));
    assert!(matches!(
        h.client.edit_message(&pending, "x").await,
        Err(ChatError::MessagePending(_))
    ));
    assert!(matches!(
        h.client.edit_message(&MessageId::from("nope"), "x").await,
        Err(ChatError::UnknownMessage(_))
    ));
    assert!(h.channel.emitted_named("edit_message").is_empty());
}

#[tokio::test]
async fn unsend_removes_everywhere_and_suppresses_late_delivery() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client.send_text("oops", None).await.expect("send");
    let id = h.client.messages().await[0].id.clone();

    h.client.unsend(&id).await.expect("unsend");
    assert!(h.client.messages().await.is_empty());
    assert!(h.cached_ids(&bo()).await.is_empty());

    h.client
        .handle_event(incoming(id.as_str(), me(), bo(), "oops"))
        .await;
    assert!(h.client.messages().await.is_empty());
    assert!(h.cached_ids(&bo()).await.is_empty());

    h.client
        .handle_event(incoming("srv-9", bo(), me(), "theirs"))
        .await;
    assert!(matches!(
        h.client.unsend(&MessageId::from("srv-9")).await,
        Err(ChatError::NotOwnMessage)
    ));
}

#[tokio::test]
async fn peer_unsend_removes_message_and_stops_its_playback() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-1", bo(), me(), "voice"))
        .await;
    h.client
        .set_active_audio(MessageId::from("srv-1"), bo())
        .await;

    h.client
        .handle_event(ServerEvent::Unsent {
            message_id: MessageId::from("srv-1"),
            sender_id: Some(bo()),
        })
        .await;

    assert!(h.client.messages().await.is_empty());
    assert!(h.cached_ids(&bo()).await.is_empty());
    assert_eq!(h.client.active_audio(), None);
}

#[tokio::test]
async fn reaction_toggle_twice_restores_the_set() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-1", bo(), me(), "nice"))
        .await;
    let id = MessageId::from("srv-1");

    h.client.toggle_reaction(&id, "👍").await.expect("react");
    assert_eq!(h.client.messages().await[0].reactions.len(), 1);
    h.client.toggle_reaction(&id, "👍").await.expect("react");
    assert!(h.client.messages().await[0].reactions.is_empty());
    assert_eq!(h.channel.emitted_named("react").len(), 2);
}

#[tokio::test]
async fn reacting_to_a_pending_message_is_rejected() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    let pending = h.client.send_text("wait", None).await.expect("send");
    assert!(matches!(
        h.client.toggle_reaction(&pending, "👍").await,
        Err(ChatError::MessagePending(_))
    ));
}

#[tokio::test]
async fn events_for_other_conversations_only_reach_the_cache() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;

    h.client
        .handle_event(incoming("srv-c1", cy(), me(), "from cy"))
        .await;
    assert!(h.client.messages().await.is_empty());
    assert_eq!(h.cached_ids(&cy()).await, vec!["srv-c1".to_string()]);

    h.open(cy()).await;
    assert_eq!(h.ids().await, vec!["srv-c1".to_string()]);
}

#[tokio::test]
async fn confirmation_after_switching_conversation_updates_the_cache() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    let temp_id = h.client.send_text("bye", None).await.expect("send");
    h.open(cy()).await;

    h.client
        .handle_event(ServerEvent::MessageIncoming {
            temp_id: Some(temp_id),
            message: payload("srv-5", me(), bo(), "bye"),
        })
        .await;

    assert!(h.client.messages().await.is_empty());
    assert_eq!(h.cached_ids(&bo()).await, vec!["srv-5".to_string()]);
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client.send_text("hi", None).await.expect("send");
    let id = h.client.messages().await[0].id.clone();

    for status in [MessageStatus::Read, MessageStatus::Delivered] {
        h.client
            .handle_event(ServerEvent::StatusChanged {
                message_id: id.clone(),
                status,
            })
            .await;
    }

    assert_eq!(h.client.messages().await[0].status, MessageStatus::Read);
    let cached = h.storage.get(&id).await.expect("get").expect("row");
    assert_eq!(cached.status, "read");
}

#[tokio::test]
async fn peer_edit_and_reactions_apply() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-1", bo(), me(), "helo"))
        .await;
    h.client
        .handle_event(ServerEvent::Edited {
            message_id: MessageId::from("srv-1"),
            content: "hello".into(),
        })
        .await;
    h.client
        .handle_event(ServerEvent::ReactionChanged {
            message_id: MessageId::from("srv-1"),
            reactions: vec![shared::domain::Reaction {
                emoji: "🎉".into(),
                user_id: bo(),
            }],
        })
        .await;

    let message = h.client.messages().await.remove(0);
    assert_eq!(message.content, "hello");
    assert!(message.edited);
    assert_eq!(message.reactions.len(), 1);
}

#[tokio::test]
async fn history_replaces_view_but_keeps_pending_sends() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-gone", bo(), me(), "deleted remotely"))
        .await;
    let pending = h.client.send_text("still sending", None).await.expect("send");

    let mut older = payload("srv-0", bo(), me(), "before");
    older.timestamp = Some(Utc::now() - chrono::Duration::seconds(60));
    let mut newer = payload("srv-1", bo(), me(), "from server");
    newer.timestamp = Some(Utc::now() + chrono::Duration::seconds(30));
    h.api.set_history(&bo(), vec![older, newer]);
    h.open(bo()).await;

    assert_eq!(
        h.ids().await,
        vec!["srv-0".to_string(), "srv-1".to_string(), pending.0.clone()]
    );
    let cached = h.cached_ids(&bo()).await;
    assert!(cached.contains(&"srv-1".to_string()));
    assert!(!cached.contains(&"srv-gone".to_string()));
}

#[tokio::test]
async fn history_page_leaves_older_cached_messages_alone() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    for (id, hours) in [("srv-a", 10), ("srv-b", 9), ("srv-c", 8)] {
        let mut old = payload(id, bo(), me(), "from earlier");
        old.timestamp = Some(Utc::now() - chrono::Duration::hours(hours));
        h.client
            .handle_event(ServerEvent::MessageIncoming {
                temp_id: None,
                message: old,
            })
            .await;
    }

    h.api
        .set_history(&bo(), vec![payload("srv-new", bo(), me(), "latest")]);
    h.open(bo()).await;

    let expected: Vec<String> = ["srv-a", "srv-b", "srv-c", "srv-new"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(h.ids().await, expected);
    assert_eq!(h.cached_ids(&bo()).await, expected);
}

#[tokio::test]
async fn send_found_in_history_is_not_shown_twice() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    let temp_id = h.client.send_text("hello", None).await.expect("send");

    h.api
        .set_history(&bo(), vec![payload("srv-99", me(), bo(), "hello")]);
    h.open(bo()).await;
    assert_eq!(h.ids().await, vec!["srv-99".to_string()]);

    h.client
        .handle_event(incoming("srv-99", me(), bo(), "hello"))
        .await;

    assert_eq!(h.ids().await, vec!["srv-99".to_string()]);
    assert_eq!(h.cached_ids(&bo()).await, vec!["srv-99".to_string()]);
    assert!(h.storage.get(&temp_id).await.expect("get").is_none());

    h.open(bo()).await;
    assert_eq!(h.ids().await, vec!["srv-99".to_string()]);
}

#[tokio::test]
async fn voice_note_confirmed_by_history_still_gets_its_metadata() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    let voice = VoiceNote {
        waveform: vec![0.5, 0.1],
        duration_secs: 2.0,
    };
    h.client
        .send_voice_note(OutgoingFile::new("memo.ogg", "audio/ogg", vec![1; 8]), voice)
        .await
        .expect("send");

    let mut stored = payload("srv-v", me(), bo(), "Voice message");
    stored.kind = MessageKind::Audio;
    stored.attachment = h.client.messages().await[0].attachment.clone();
    h.api.set_history(&bo(), vec![stored]);
    h.open(bo()).await;

    assert_eq!(h.ids().await, vec!["srv-v".to_string()]);
    assert_eq!(
        h.channel.emitted_named("voice_metadata"),
        vec![ClientRequest::VoiceMetadata {
            message_id: MessageId::from("srv-v"),
            recipient_id: bo(),
            waveform: vec![0.5, 0.1],
            duration_secs: 2.0,
        }]
    );
}

#[tokio::test]
async fn stale_history_is_discarded() {
    let h = Harness::new(AckMode::Confirm).await;
    h.api
        .set_history(&bo(), vec![payload("srv-b", bo(), me(), "for bo")]);
    h.api
        .set_history(&cy(), vec![payload("srv-c", cy(), me(), "for cy")]);
    let release_bo = h.api.gate(&bo());

    let bo_sync = h.client.open_conversation(bo()).await;
    let cy_sync = h.client.open_conversation(cy()).await;
    cy_sync.await.expect("cy history");
    release_bo.send(()).expect("release");
    bo_sync.await.expect("bo history");

    assert_eq!(h.client.open_peer().await, Some(cy()));
    assert_eq!(h.ids().await, vec!["srv-c".to_string()]);
    assert!(h.cached_ids(&bo()).await.is_empty());
}

#[tokio::test]
async fn failed_history_keeps_the_cached_view() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-1", bo(), me(), "cached"))
        .await;

    h.api.fail_history.store(true, Ordering::SeqCst);
    h.client.close_conversation().await;
    h.open(bo()).await;

    assert_eq!(h.ids().await, vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn broken_cache_degrades_to_memory() {
    let channel = TestChannel::new(AckMode::Confirm);
    let api = Arc::new(TestApi::default());
    let client = ChatClient::new(
        settings(),
        me(),
        channel.clone(),
        api.clone(),
        api,
        Arc::new(BrokenStore),
    );

    client.open_conversation(bo()).await.await.expect("history");
    assert!(client.messages().await.is_empty());

    client.send_text("still works", None).await.expect("send");
    let messages = client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn oversized_file_is_rejected_before_upload() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;

    let results = h
        .client
        .send_attachments(vec![
            OutgoingFile::new("huge.bin", "application/octet-stream", vec![0; 2048]),
            OutgoingFile::new("cat.png", "image/png", vec![0; 16]),
        ])
        .await;

    assert!(matches!(results[0], Err(ChatError::FileTooLarge { .. })));
    assert!(results[1].is_ok());
    assert_eq!(h.api.uploads(), vec!["cat.png".to_string()]);

    let messages = h.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::Image);
    assert_eq!(
        messages[0].attachment.as_ref().map(|a| a.file_url.as_str()),
        Some("https://cdn.example/cat.png")
    );
}

#[tokio::test]
async fn failed_upload_does_not_block_the_rest() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    *h.api.failing_upload.lock().expect("failing") = Some("a.pdf".into());

    let results = h
        .client
        .send_attachments(vec![
            OutgoingFile::new("a.pdf", "application/pdf", vec![1; 8]),
            OutgoingFile::new("b.pdf", "application/pdf", vec![2; 8]),
        ])
        .await;

    assert!(matches!(results[0], Err(ChatError::Upload(_))));
    assert!(results[1].is_ok());
    let messages = h.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "b.pdf");
    assert_eq!(messages[0].kind, MessageKind::File);
}

#[tokio::test]
async fn voice_metadata_follows_confirmation() {
    let h = Harness::new(AckMode::Silent).await;
    h.open(bo()).await;
    let voice = VoiceNote {
        waveform: vec![0.2, 0.9, 0.4],
        duration_secs: 4.0,
    };
    let temp_id = h
        .client
        .send_voice_note(OutgoingFile::new("note.webm", "audio/webm", vec![3; 32]), voice)
        .await
        .expect("send");
    assert!(h.channel.emitted_named("voice_metadata").is_empty());

    let mut echo = payload("srv-v", me(), bo(), "Voice message");
    echo.kind = MessageKind::Audio;
    h.client
        .handle_event(ServerEvent::MessageIncoming {
            temp_id: Some(temp_id),
            message: echo,
        })
        .await;

    assert_eq!(
        h.channel.emitted_named("voice_metadata"),
        vec![ClientRequest::VoiceMetadata {
            message_id: MessageId::from("srv-v"),
            recipient_id: bo(),
            waveform: vec![0.2, 0.9, 0.4],
            duration_secs: 4.0,
        }]
    );
    let message = h.client.messages().await.remove(0);
    assert_eq!(message.kind, MessageKind::Audio);
    assert_eq!(
        message.attachment.map(|a| a.duration_secs),
        Some(Some(4.0))
    );
}

#[tokio::test]
async fn listening_notifications_for_peer_voice_notes() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    let theirs = MessageId::from("srv-1");
    let mine = MessageId::from("srv-2");
    let mut signals = h.client.audio_signals();

    h.client.set_active_audio(theirs.clone(), bo()).await;
    h.client.set_active_audio(mine.clone(), me()).await;
    h.client.set_active_audio(theirs.clone(), bo()).await;
    assert_eq!(h.channel.emitted_named("voice_listening").len(), 1);
    assert_eq!(
        signals.try_recv().expect("pause"),
        AudioSignal::Pause(theirs.clone())
    );

    h.client.audio_ended(&theirs).await;
    assert_eq!(
        h.channel.emitted_named("voice_listened"),
        vec![ClientRequest::VoiceListened {
            message_id: theirs,
            sender_id: bo(),
        }]
    );
    assert_eq!(h.client.active_audio(), None);

    h.client.set_active_audio(mine.clone(), me()).await;
    h.client.audio_ended(&mine).await;
    assert_eq!(h.channel.emitted_named("voice_listened").len(), 1);
}

#[tokio::test]
async fn peer_listening_updates_presence_and_status() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client.send_text("voice stand-in", None).await.expect("send");
    let id = h.client.messages().await[0].id.clone();

    h.client
        .handle_event(ServerEvent::VoiceListening {
            message_id: id.clone(),
            listener_id: bo(),
        })
        .await;
    assert_eq!(h.client.presence().listening_to, Some(id.clone()));

    h.client
        .handle_event(ServerEvent::VoiceListened {
            message_id: id.clone(),
            listener_id: bo(),
        })
        .await;
    assert_eq!(h.client.presence().listening_to, None);
    assert_eq!(h.client.messages().await[0].status, MessageStatus::Read);
}

#[tokio::test]
async fn typing_indicators_are_scoped_to_the_open_peer() {
    let h = Harness::with_settings(
        AckMode::Confirm,
        ClientSettings {
            ghost_text: true,
            ..settings()
        },
    )
    .await;
    h.open(bo()).await;

    h.client
        .handle_event(ServerEvent::TypingStarted {
            sender_id: cy(),
            preview: Some("hi".into()),
        })
        .await;
    assert!(!h.client.presence().typing);

    h.client
        .handle_event(ServerEvent::TypingStarted {
            sender_id: bo(),
            preview: Some("hel".into()),
        })
        .await;
    assert!(h.client.presence().typing);
    assert_eq!(h.client.presence().ghost_text.as_deref(), Some("hel"));

    h.open(cy()).await;
    assert!(!h.client.presence().typing);
}

#[tokio::test]
async fn outbound_typing_shares_draft_only_with_ghost_text() {
    let plain = Harness::new(AckMode::Confirm).await;
    plain.open(bo()).await;
    plain.client.set_typing(true, Some("draft")).await;
    plain.client.set_recording(true).await;
    assert_eq!(
        plain.channel.emitted(),
        vec![
            ClientRequest::Typing {
                recipient_id: bo(),
                active: true,
                preview: None,
            },
            ClientRequest::Recording {
                recipient_id: bo(),
                active: true,
            },
        ]
    );

    let ghost = Harness::with_settings(
        AckMode::Confirm,
        ClientSettings {
            ghost_text: true,
            ..settings()
        },
    )
    .await;
    ghost.open(bo()).await;
    ghost.client.set_typing(true, Some("draft")).await;
    assert_eq!(
        ghost.channel.emitted(),
        vec![ClientRequest::Typing {
            recipient_id: bo(),
            active: true,
            preview: Some("draft".into()),
        }]
    );
}

#[tokio::test]
async fn reply_snapshot_travels_with_the_send() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    h.client
        .handle_event(incoming("srv-1", bo(), me(), "question?"))
        .await;
    let original = h.client.messages().await.remove(0);

    h.client
        .send_text("answer", Some(original.snapshot(Some("Bo".into()))))
        .await
        .expect("send");

    let reply = h.client.messages().await.remove(1);
    assert_eq!(
        reply.reply_to,
        Some(ReplySnapshot {
            id: MessageId::from("srv-1"),
            content: "question?".into(),
            sender_id: bo(),
            sender_name: Some("Bo".into()),
            kind: MessageKind::Text,
        })
    );
}

#[tokio::test]
async fn server_errors_become_notices() {
    let h = Harness::new(AckMode::Confirm).await;
    let mut events = h.client.subscribe_events();
    h.client
        .handle_event(ServerEvent::Error(ApiError::new(
            ErrorCode::RateLimited,
            "slow down",
        )))
        .await;
    assert_eq!(drain_notices(&mut events), vec!["slow down".to_string()]);
}

#[tokio::test]
async fn inbound_loop_applies_channel_events() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    let loop_handle = h.client.start();
    let mut events = h.client.subscribe_events();

    h.channel
        .events
        .send(incoming("srv-1", bo(), me(), "pushed"))
        .expect("send event");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::MessagesChanged { messages, .. }) = events.recv().await {
                if messages.len() == 1 {
                    break;
                }
            }
        }
    })
    .await
    .expect("event applied");
    loop_handle.abort();

    assert_eq!(h.ids().await, vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn unsend_arriving_before_the_message_keeps_it_out() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;

    h.client
        .handle_event(ServerEvent::Unsent {
            message_id: MessageId::from("srv-5"),
            sender_id: Some(bo()),
        })
        .await;
    h.client
        .handle_event(incoming("srv-5", bo(), me(), "never mind"))
        .await;

    assert!(h.client.messages().await.is_empty());
    assert!(h.cached_ids(&bo()).await.is_empty());
}

#[tokio::test]
async fn offline_reopen_shows_the_cached_conversation() {
    let h = Harness::new(AckMode::Confirm).await;
    h.open(bo()).await;
    for (id, minutes) in [("srv-1", 3), ("srv-2", 2), ("srv-3", 1)] {
        let mut cached = payload(id, bo(), me(), "cached");
        cached.timestamp = Some(Utc::now() - chrono::Duration::minutes(minutes));
        h.client
            .handle_event(ServerEvent::MessageIncoming {
                temp_id: None,
                message: cached,
            })
            .await;
    }
    h.client.close_conversation().await;

    h.channel.connected.store(false, Ordering::SeqCst);
    h.api.fail_history.store(true, Ordering::SeqCst);
    let release = h.api.gate(&bo());
    let mut events = h.client.subscribe_events();

    let sync = h.client.open_conversation(bo()).await;
    let shown: Vec<String> = h
        .client
        .messages()
        .await
        .into_iter()
        .map(|message| message.id.0)
        .collect();
    assert_eq!(shown, vec!["srv-1", "srv-2", "srv-3"]);

    release.send(()).expect("release");
    sync.await.expect("history task");
    assert_eq!(h.ids().await, shown);
    assert!(drain_notices(&mut events).is_empty());
}

#[tokio::test]
async fn closing_drops_voice_notes_of_failed_sends() {
    let h = Harness::new(AckMode::Reject).await;
    h.open(bo()).await;
    let voice = VoiceNote {
        waveform: vec![0.3],
        duration_secs: 1.0,
    };
    let result = h
        .client
        .send_voice_note(OutgoingFile::new("memo.ogg", "audio/ogg", vec![1; 8]), voice)
        .await;
    assert!(matches!(result, Err(ChatError::Rejected(_))));
    assert_eq!(h.client.state.lock().await.pending_voice_notes.len(), 1);

    h.client.close_conversation().await;
    assert!(h.client.state.lock().await.pending_voice_notes.is_empty());
}

#[test]
fn tombstones_keep_only_the_most_recent_ids() {
    let mut tombstones = Tombstones::with_capacity(2);
    tombstones.insert(MessageId::from("a"));
    tombstones.insert(MessageId::from("b"));
    tombstones.insert(MessageId::from("b"));
    tombstones.insert(MessageId::from("c"));

    assert!(!tombstones.contains(&MessageId::from("a")));
    assert!(tombstones.contains(&MessageId::from("b")));
    assert!(tombstones.contains(&MessageId::from("c")));
}
