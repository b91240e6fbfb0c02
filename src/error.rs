use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("invalid document at '{path}': {reason}")]
    InvalidDocument {
        path: String,
        reason: String,
    },

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum ChatError {
    /// Blank or whitespace-only text; nothing was written.
    #[error("message text is empty")]
    EmptyMessage,

    #[error("sender and recipient are the same participant: {0}")]
    SelfChat(String),

    #[error("no local message with client id {0}")]
    UnknownMessage(uuid::Uuid),

    #[error("message {0} has not failed")]
    NotFailed(uuid::Uuid),

    #[error("malformed record at '{path}': {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Store failures can be retried; validation failures cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Store(_))
    }
}
