use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{
        Attachment, ConversationKey, Message, MessageId, MessageKind, MessagePatch,
        MessageStatus, UserId,
    },
    protocol::MessagePayload,
};

use crate::cache::{confirm_provisional, message_from_payload};

/// How far a confirmed copy may predate the provisional record it confirms.
const ECHO_CLOCK_SKEW_SECS: i64 = 300;

/// What folding a `message_incoming` into the open view did.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// A provisional record was replaced in place by its confirmed version.
    Promoted { temp_id: MessageId, message: Message },
    /// The provisional record was dropped because the confirmed id was already present.
    Collapsed { temp_id: MessageId, message_id: MessageId },
    /// The permanent id was already present.
    Duplicate(MessageId),
    /// A new record went to the end of the list.
    Appended(Message),
}

/// Result of [`ConversationView::merge_history`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryMerge {
    /// Local records the server no longer has.
    pub dropped: Vec<MessageId>,
    /// Provisional records whose confirmed copy was in the history, as
    /// `(temp_id, permanent_id)`.
    pub confirmed: Vec<(MessageId, MessageId)>,
}

/// In-memory, ordered message list of the open conversation.
#[derive(Debug, Clone)]
pub struct ConversationView {
    peer: UserId,
    key: ConversationKey,
    messages: Vec<Message>,
    /// Permanent ids that already replaced a provisional record.
    confirmations: HashSet<MessageId>,
}

impl ConversationView {
    pub fn new(local_user: &UserId, peer: UserId, messages: Vec<Message>) -> Self {
        Self {
            key: ConversationKey::between(local_user, &peer),
            peer,
            messages,
            confirmations: HashSet::new(),
        }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.position(id)?;
        Some(self.messages.remove(index))
    }

    pub fn patch(&mut self, id: &MessageId, patch: &MessagePatch) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.apply(patch);
                true
            }
            None => false,
        }
    }

    /// Applies `status` only if it moves the message forward. Returns whether it did.
    pub fn advance_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) if message.status.can_transition_to(status) => {
                message.status = status;
                true
            }
            _ => false,
        }
    }

    /// Folds a server-confirmed message into the list.
    ///
    /// Order matters: an explicit temporary-id reference is resolved first, then
    /// duplicates by permanent id, then an echo of our own send is matched to the
    /// oldest pending provisional record, and only then is the message appended.
    /// A permanent id confirms at most one provisional record; if it is already
    /// listed without having done so, its oldest matching provisional record is
    /// collapsed into it.
    pub fn reconcile(
        &mut self,
        temp_id: Option<&MessageId>,
        payload: MessagePayload,
        local_user: &UserId,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        if let Some(index) = temp_id.and_then(|id| self.position(id)) {
            return self.promote_at(index, payload);
        }

        if let Some(existing) = self.get(&payload.id) {
            if &existing.sender_id == local_user && !self.confirmations.contains(&payload.id) {
                if let Some(index) = self.pending_echo_of(existing) {
                    let temp_id = self.messages.remove(index).id;
                    self.confirmations.insert(payload.id.clone());
                    return Reconciliation::Collapsed {
                        temp_id,
                        message_id: payload.id,
                    };
                }
            }
            return Reconciliation::Duplicate(payload.id);
        }

        if &payload.sender_id == local_user {
            if let Some(index) = self.pending_echo_position(&payload) {
                return self.promote_at(index, payload);
            }
        }

        let message = message_from_payload(payload, now);
        self.messages.push(message.clone());
        Reconciliation::Appended(message)
    }

    fn promote_at(&mut self, index: usize, payload: MessagePayload) -> Reconciliation {
        let temp_id = self.messages[index].id.clone();
        self.confirmations.insert(payload.id.clone());
        if self.contains(&payload.id) {
            self.messages.remove(index);
            return Reconciliation::Collapsed {
                temp_id,
                message_id: payload.id,
            };
        }

        let confirmed = confirm_provisional(&self.messages[index], payload);
        self.messages[index] = confirmed.clone();
        Reconciliation::Promoted {
            temp_id,
            message: confirmed,
        }
    }

    fn pending_echo_position(&self, payload: &MessagePayload) -> Option<usize> {
        self.messages.iter().position(|m| {
            is_pending_echo(
                m,
                &payload.recipient_id,
                payload.kind,
                &payload.content,
                payload.attachment.as_ref(),
            )
        })
    }

    /// Oldest provisional record that `confirmed`, already in the list, stands for.
    fn pending_echo_of(&self, confirmed: &Message) -> Option<usize> {
        self.messages.iter().position(|m| confirms(confirmed, m))
    }

    /// Replaces the list with the server's page of history.
    ///
    /// Local records outside the page's time span are kept, since the page only
    /// covers the most recent messages. Records inside the span that the server
    /// does not have are dropped. A provisional record whose confirmed copy is in
    /// the page is dropped too and reported in `confirmed`.
    pub fn merge_history(&mut self, server: Vec<Message>) -> HistoryMerge {
        let oldest_server = server.iter().map(|m| m.timestamp).min();
        let newest_server = server.iter().map(|m| m.timestamp).max();
        let server_ids: HashSet<&MessageId> = server.iter().map(|m| &m.id).collect();
        let known: HashSet<MessageId> = self.messages.iter().map(|m| m.id.clone()).collect();

        let mut merge = HistoryMerge::default();
        let mut earlier = Vec::new();
        let mut later = Vec::new();
        for message in self.messages.drain(..) {
            if server_ids.contains(&message.id) {
                continue;
            }
            if message.id.is_temporary() {
                later.push(message);
                continue;
            }
            match (oldest_server, newest_server) {
                (Some(oldest), _) if message.timestamp < oldest => earlier.push(message),
                (_, Some(newest)) if message.timestamp > newest => later.push(message),
                (None, _) => earlier.push(message),
                _ => merge.dropped.push(message.id),
            }
        }

        for confirmed in server.iter().filter(|m| !known.contains(&m.id)) {
            if self.confirmations.contains(&confirmed.id) {
                continue;
            }
            if let Some(index) = later.iter().position(|m| confirms(confirmed, m)) {
                let temp_id = later.remove(index).id;
                self.confirmations.insert(confirmed.id.clone());
                merge.confirmed.push((temp_id, confirmed.id.clone()));
            }
        }

        self.messages = earlier;
        self.messages.extend(server);
        self.messages.extend(later);
        merge
    }
}

fn is_pending_echo(
    pending: &Message,
    recipient_id: &UserId,
    kind: MessageKind,
    content: &str,
    attachment: Option<&Attachment>,
) -> bool {
    pending.id.is_temporary()
        && pending.status == MessageStatus::Sending
        && &pending.recipient_id == recipient_id
        && pending.kind == kind
        && match (&pending.attachment, attachment) {
            (Some(local), Some(remote)) => local.file_url == remote.file_url,
            _ => pending.content == content,
        }
}

/// Whether the confirmed `message` is the server copy of the provisional `pending`.
fn confirms(message: &Message, pending: &Message) -> bool {
    message.sender_id == pending.sender_id
        && message.timestamp + Duration::seconds(ECHO_CLOCK_SKEW_SECS) >= pending.timestamp
        && is_pending_echo(
            pending,
            &message.recipient_id,
            message.kind,
            &message.content,
            message.attachment.as_ref(),
        )
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
