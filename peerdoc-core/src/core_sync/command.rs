//! Side effects requested by the synchronizer
//!
//! The host matches on these after every `update` call. Results that the
//! core cares about come back as new [`Message`](super::message::Message)s.

use std::time::Duration;

use super::model::RequestKey;
use super::types::{ChannelId, DocId};
use super::wire::ChannelMsg;
use crate::core_doc::{DocHandle, VersionVector};

#[derive(Debug, Clone)]
pub enum Command {
    /// Hand a protocol message to a channel adapter
    Send {
        channel_id: ChannelId,
        message: ChannelMsg,
    },
    /// Deliver `Message::Timeout { key }` after `after`, replacing any timer with the same key
    StartTimer { key: RequestKey, after: Duration },
    CancelTimer { key: RequestKey },
    /// Import peer data; answer with `Message::ImportCompleted`
    Import {
        channel_id: ChannelId,
        doc_id: DocId,
        doc: DocHandle,
        data: Vec<u8>,
        peer_version: VersionVector,
    },
    /// Route local edits of this document back as `Message::LocalDocChange`
    Subscribe { doc_id: DocId, doc: DocHandle },
    /// No channel is loading this document any more
    DocReady { doc_id: DocId },
    /// The document left the model
    DocRemoved { doc_id: DocId },
    /// Presence entries of this document changed
    PresenceChanged { doc_id: DocId },
}

impl Command {
    pub fn send(channel_id: ChannelId, message: ChannelMsg) -> Self {
        Command::Send {
            channel_id,
            message,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Send { .. } => "send",
            Command::StartTimer { .. } => "start-timer",
            Command::CancelTimer { .. } => "cancel-timer",
            Command::Import { .. } => "import",
            Command::Subscribe { .. } => "subscribe",
            Command::DocReady { .. } => "doc-ready",
            Command::DocRemoved { .. } => "doc-removed",
            Command::PresenceChanged { .. } => "presence-changed",
        }
    }
}
