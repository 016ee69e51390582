use crate::api::ApiError;
use crate::realtime::RealtimeError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, FlechazoError>;

#[derive(Error, Debug)]
pub enum FlechazoError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No active session")]
    NoSession,

    #[error("Conversation not loaded yet")]
    NotLoaded,

    #[error("Conversation is closed")]
    ConversationClosed,

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("Api error: {0}")]
    Api(#[from] ApiError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for FlechazoError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        FlechazoError::Other(anyhow::anyhow!(err.to_string()))
    }
}
