use shared::domain::MessageId;
use thiserror::Error;

/// User-facing failures of the conversation operations.
///
/// Unknown ids and duplicate deliveries are not represented here: they are no-ops.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not connected; try again once the connection is back")]
    NotConnected,
    #[error("message is empty")]
    EmptyContent,
    #[error("{name} is {size} bytes, over the {limit} byte limit")]
    FileTooLarge { name: String, size: u64, limit: u64 },
    #[error("only your own text messages can be edited")]
    NotEditable,
    #[error("only your own messages can be unsent")]
    NotOwnMessage,
    #[error("message {0} is still sending")]
    MessagePending(MessageId),
    #[error("message {0} is not in this conversation")]
    UnknownMessage(MessageId),
    #[error("message {0} has not failed")]
    NotRetryable(MessageId),
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
