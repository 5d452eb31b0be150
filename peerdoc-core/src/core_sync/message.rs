//! Inputs to the synchronizer
//!
//! The host translates every external event (transport, timer, local API
//! call, command result) into one of these and feeds it to `update`.

use super::model::RequestKey;
use super::types::{ChannelId, ChannelKind, DocId, Timestamp};
use super::wire::ChannelMsg;
use crate::core_doc::VersionVector;

#[derive(Debug, Clone)]
pub enum Message {
    /// A ready-to-use transport endpoint was registered
    ChannelAdded {
        channel_id: ChannelId,
        kind: ChannelKind,
    },
    /// Start the handshake from our side
    EstablishChannel { channel_id: ChannelId },
    /// The adapter reported a transport error; the channel stays registered
    ChannelFailed {
        channel_id: ChannelId,
        reason: String,
    },
    ChannelRemoved {
        channel_id: ChannelId,
        now: Timestamp,
    },
    /// One outbound message could not be framed; the channel itself is fine
    SendRejected {
        channel_id: ChannelId,
        doc_id: Option<DocId>,
        reason: String,
    },
    /// A protocol message arrived and passed middleware
    ChannelReceived {
        channel_id: ChannelId,
        message: ChannelMsg,
    },
    /// Local access to a document; creates it when absent
    DocEnsure { doc_id: DocId },
    /// The local replica was edited
    LocalDocChange { doc_id: DocId },
    /// Delete a document here and ask peers to do the same
    DocDelete { doc_id: DocId },
    /// Set (or clear, with `None`) one of our presence entries
    LocalPresence {
        doc_id: DocId,
        namespace: String,
        value: Option<Vec<u8>>,
        now: Timestamp,
    },
    HeartbeatTick { now: Timestamp },
    PresenceSweep { now: Timestamp },
    /// A request deadline fired
    Timeout { key: RequestKey },
    /// Result of `Command::Import`
    ImportCompleted {
        channel_id: ChannelId,
        doc_id: DocId,
        peer_version: VersionVector,
        result: Result<VersionVector, String>,
    },
}

impl Message {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ChannelAdded { .. } => "channel-added",
            Message::EstablishChannel { .. } => "establish-channel",
            Message::ChannelFailed { .. } => "channel-failed",
            Message::ChannelRemoved { .. } => "channel-removed",
            Message::SendRejected { .. } => "send-rejected",
            Message::ChannelReceived { .. } => "channel-received",
            Message::DocEnsure { .. } => "doc-ensure",
            Message::LocalDocChange { .. } => "local-doc-change",
            Message::DocDelete { .. } => "doc-delete",
            Message::LocalPresence { .. } => "local-presence",
            Message::HeartbeatTick { .. } => "heartbeat-tick",
            Message::PresenceSweep { .. } => "presence-sweep",
            Message::Timeout { .. } => "timeout",
            Message::ImportCompleted { .. } => "import-completed",
        }
    }
}
