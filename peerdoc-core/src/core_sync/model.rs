/*
    model.rs - The synchronizer's entire state

    One value owns every registry: channels, documents with their
    per-channel sync state, presence, and in-flight requests. Cross
    references are ids into these maps, never pointers.
*/

use std::collections::HashMap;
use std::sync::Arc;

use super::presence::PresenceStore;
use super::rules::{DocContext, PeerContext, Rules};
use super::types::{ChannelId, ChannelKind, DocId, PeerIdentity};
use crate::config::{PresenceConfig, SyncConfig};
use crate::core_doc::{DocHandle, DocumentFactory, VersionVector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Unestablished,
    Established { identity: PeerIdentity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// One transport endpoint
#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub peer: PeerState,
    pub connection_state: ConnectionState,
}

impl Channel {
    pub fn new(channel_id: ChannelId, kind: ChannelKind) -> Self {
        Channel {
            channel_id,
            kind,
            peer: PeerState::Unestablished,
            connection_state: ConnectionState::Connecting,
        }
    }

    pub fn identity(&self) -> Option<&PeerIdentity> {
        match &self.peer {
            PeerState::Established { identity } => Some(identity),
            PeerState::Unestablished => None,
        }
    }

    /// Established and not failed
    pub fn is_usable(&self) -> bool {
        self.identity().is_some() && self.connection_state == ConnectionState::Connected
    }

    pub fn peer_context(&self) -> Option<PeerContext<'_>> {
        self.identity().map(|identity| PeerContext {
            channel_id: self.channel_id,
            channel_kind: self.kind,
            identity,
        })
    }
}

/// What we know about a channel's interest in a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awareness {
    Unknown,
    HasDoc,
    NoDoc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadingState {
    /// Nothing requested yet
    Idle,
    Loading,
    Found { version: VersionVector },
    NotFound,
    /// Importing data from this channel failed; not retried
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDocState {
    pub awareness: Awareness,
    pub loading: LoadingState,
    pub last_known_version: VersionVector,
    /// Reveal rule result computed when the pairing was created
    pub can_reveal: bool,
}

impl ChannelDocState {
    pub fn new(can_reveal: bool) -> Self {
        ChannelDocState {
            awareness: Awareness::Unknown,
            loading: LoadingState::Idle,
            last_known_version: VersionVector::new(),
            can_reveal,
        }
    }

    /// Record that the peer holds the document. `HasDoc` is terminal.
    pub fn mark_has_doc(&mut self) {
        self.awareness = Awareness::HasDoc;
    }

    /// Record that the peer lacks the document; only from `Unknown`
    pub fn mark_no_doc(&mut self) {
        if self.awareness == Awareness::Unknown {
            self.awareness = Awareness::NoDoc;
        }
    }
}

/// One document's local view of sync progress
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub doc_id: DocId,
    pub doc: DocHandle,
    pub channel_state: HashMap<ChannelId, ChannelDocState>,
    pub subscribed: bool,
}

impl DocumentState {
    pub fn new(doc_id: DocId, doc: DocHandle) -> Self {
        DocumentState {
            doc_id,
            doc,
            channel_state: HashMap::new(),
            subscribed: false,
        }
    }

    pub fn context(&self) -> DocContext<'_> {
        DocContext {
            doc_id: &self.doc_id,
            doc: &self.doc,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.channel_state
            .values()
            .any(|state| state.loading == LoadingState::Loading)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKind {
    Directory,
    Sync(DocId),
}

/// Identifies an in-flight request and its deadline timer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    pub channel_id: ChannelId,
    pub kind: RequestKind,
}

impl RequestKey {
    pub fn directory(channel_id: ChannelId) -> Self {
        RequestKey {
            channel_id,
            kind: RequestKind::Directory,
        }
    }

    pub fn sync(channel_id: ChannelId, doc_id: DocId) -> Self {
        RequestKey {
            channel_id,
            kind: RequestKind::Sync(doc_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Re-sends so far
    pub attempt: u32,
    pub bidirectional: bool,
    /// Version carried by the latest send; empty for directory requests
    pub sent_version: VersionVector,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub identity: PeerIdentity,
    pub channels: HashMap<ChannelId, Channel>,
    pub documents: HashMap<DocId, DocumentState>,
    pub presence: PresenceStore,
    pub pending: HashMap<RequestKey, PendingRequest>,
    pub rules: Rules,
    pub sync_config: SyncConfig,
    pub presence_config: PresenceConfig,
    pub factory: Arc<dyn DocumentFactory>,
}

impl Model {
    pub fn new(identity: PeerIdentity, factory: Arc<dyn DocumentFactory>) -> Self {
        Model {
            identity,
            channels: HashMap::new(),
            documents: HashMap::new(),
            presence: PresenceStore::new(),
            pending: HashMap::new(),
            rules: Rules::new(),
            sync_config: SyncConfig::default(),
            presence_config: PresenceConfig::default(),
            factory,
        }
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    pub fn with_presence_config(mut self, config: PresenceConfig) -> Self {
        self.presence_config = config;
        self
    }

    /// Established, connected channels in id order
    pub fn usable_channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|channel| channel.is_usable())
            .map(|channel| channel.channel_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.documents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channel_doc_state(
        &self,
        doc_id: &DocId,
        channel_id: ChannelId,
    ) -> Option<&ChannelDocState> {
        self.documents
            .get(doc_id)
            .and_then(|state| state.channel_state.get(&channel_id))
    }

    /// Evaluate the reveal rule for a pairing
    pub fn evaluate_reveal(&self, doc_id: &DocId, channel_id: ChannelId) -> bool {
        let (Some(doc_state), Some(channel)) =
            (self.documents.get(doc_id), self.channels.get(&channel_id))
        else {
            return false;
        };
        match channel.peer_context() {
            Some(peer) => self.rules.can_reveal(&doc_state.context(), &peer),
            None => false,
        }
    }

    /// Make sure a pairing exists, computing `can_reveal` on creation
    pub fn ensure_channel_doc_state(
        &mut self,
        doc_id: &DocId,
        channel_id: ChannelId,
    ) -> Option<&mut ChannelDocState> {
        let exists = self
            .documents
            .get(doc_id)
            .map(|state| state.channel_state.contains_key(&channel_id))?;
        if !exists {
            let can_reveal = self.evaluate_reveal(doc_id, channel_id);
            if let Some(doc_state) = self.documents.get_mut(doc_id) {
                doc_state
                    .channel_state
                    .insert(channel_id, ChannelDocState::new(can_reveal));
            }
        }
        self.documents
            .get_mut(doc_id)
            .and_then(|state| state.channel_state.get_mut(&channel_id))
    }

    /// Channels that should receive pushes and presence for a document
    pub fn interested_channels(&self, doc_id: &DocId, include_storage: bool) -> Vec<ChannelId> {
        let Some(doc_state) = self.documents.get(doc_id) else {
            return Vec::new();
        };
        let mut ids: Vec<ChannelId> = doc_state
            .channel_state
            .iter()
            .filter(|(channel_id, state)| {
                let Some(channel) = self.channels.get(*channel_id) else {
                    return false;
                };
                if !channel.is_usable() || !state.can_reveal {
                    return false;
                }
                match channel.kind {
                    ChannelKind::Storage => include_storage,
                    _ => state.awareness == Awareness::HasDoc,
                }
            })
            .map(|(channel_id, _)| *channel_id)
            .collect();
        ids.sort();
        ids
    }
}
