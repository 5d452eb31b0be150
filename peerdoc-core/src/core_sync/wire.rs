/*
    wire.rs - Protocol messages exchanged over channels

    Transport-agnostic shapes. The host codec serializes them as JSON objects
    tagged by "type":

    ```json
    { "type": "sync-request", "doc_id": "doc1", "requester_version": {}, "bidirectional": true }
    ```

    Byte payloads (document data, presence) travel as base64 strings.
*/

use serde::{Deserialize, Serialize};

use super::types::{DocId, PeerIdentity};
use crate::core_doc::VersionVector;

/// Serde adapter writing `Vec<u8>` as a base64 string
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| STANDARD.decode(text.as_bytes()).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Payload of a sync response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transmission {
    /// Full state; the requester had nothing comparable
    Snapshot {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        version: VersionVector,
    },
    /// Delta from the requester's version
    Update {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        version: VersionVector,
    },
    /// Nothing the requester lacks
    UpToDate { version: VersionVector },
    /// Unknown here, or not visible to the requester
    Unavailable,
}

impl Transmission {
    pub fn kind(&self) -> &'static str {
        match self {
            Transmission::Snapshot { .. } => "snapshot",
            Transmission::Update { .. } => "update",
            Transmission::UpToDate { .. } => "up-to-date",
            Transmission::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMsg {
    EstablishRequest {
        identity: PeerIdentity,
    },
    EstablishResponse {
        identity: PeerIdentity,
    },
    DirectoryRequest,
    DirectoryResponse {
        doc_ids: Vec<DocId>,
    },
    SyncRequest {
        doc_id: DocId,
        requester_version: VersionVector,
        bidirectional: bool,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "base64_bytes::option"
        )]
        presence: Option<Vec<u8>>,
    },
    SyncResponse {
        doc_id: DocId,
        transmission: Transmission,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "base64_bytes::option"
        )]
        presence: Option<Vec<u8>>,
    },
    Presence {
        doc_id: DocId,
        hops_remaining: u8,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    DeleteRequest {
        doc_id: DocId,
    },
    DeleteResponse {
        doc_id: DocId,
        ok: bool,
    },
    /// Transport-level grouping only
    Batch {
        messages: Vec<ChannelMsg>,
    },
}

impl ChannelMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMsg::EstablishRequest { .. } => "establish-request",
            ChannelMsg::EstablishResponse { .. } => "establish-response",
            ChannelMsg::DirectoryRequest => "directory-request",
            ChannelMsg::DirectoryResponse { .. } => "directory-response",
            ChannelMsg::SyncRequest { .. } => "sync-request",
            ChannelMsg::SyncResponse { .. } => "sync-response",
            ChannelMsg::Presence { .. } => "presence",
            ChannelMsg::DeleteRequest { .. } => "delete-request",
            ChannelMsg::DeleteResponse { .. } => "delete-response",
            ChannelMsg::Batch { .. } => "batch",
        }
    }

    /// Document the message is about, if any
    pub fn doc_id(&self) -> Option<&DocId> {
        match self {
            ChannelMsg::SyncRequest { doc_id, .. }
            | ChannelMsg::SyncResponse { doc_id, .. }
            | ChannelMsg::Presence { doc_id, .. }
            | ChannelMsg::DeleteRequest { doc_id }
            | ChannelMsg::DeleteResponse { doc_id, .. } => Some(doc_id),
            _ => None,
        }
    }

    pub fn is_establishment(&self) -> bool {
        matches!(
            self,
            ChannelMsg::EstablishRequest { .. } | ChannelMsg::EstablishResponse { .. }
        )
    }
}
