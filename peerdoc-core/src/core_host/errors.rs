//! Error types for the sync host

use thiserror::Error;

use crate::config::ConfigError;
use crate::core_doc::DocId;
use crate::core_sync::ChannelId;

/// Wire frame encoding/decoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// Storage backend failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Sync host is not running")]
    Closed,

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Channel {channel_id} send failed: {reason}")]
    Send {
        channel_id: ChannelId,
        reason: String,
    },

    #[error("Unknown document: {0}")]
    UnknownDoc(DocId),

    #[error("Document {0} was removed")]
    DocRemoved(DocId),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid host settings: {0}")]
    Config(#[from] ConfigError),
}

pub type HostResult<T> = Result<T, HostError>;
