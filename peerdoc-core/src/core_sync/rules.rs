//! Access rules evaluated by the synchronizer
//!
//! Four synchronous predicates gate what a peer may see or change. Each one
//! defaults to allow when unset. They run inside `update`, so they must be
//! pure and cheap; anything asynchronous belongs in host middleware.

use std::fmt;
use std::sync::Arc;

use super::types::{ChannelId, ChannelKind, DocId, PeerIdentity};
use crate::core_doc::DocHandle;

/// The document a rule is asked about
#[derive(Debug, Clone, Copy)]
pub struct DocContext<'a> {
    pub doc_id: &'a DocId,
    pub doc: &'a DocHandle,
}

/// The peer a rule is asked about
#[derive(Debug, Clone, Copy)]
pub struct PeerContext<'a> {
    pub channel_id: ChannelId,
    pub channel_kind: ChannelKind,
    pub identity: &'a PeerIdentity,
}

pub type DocRule = Arc<dyn Fn(&DocContext<'_>, &PeerContext<'_>) -> bool + Send + Sync>;
pub type CreateRule = Arc<dyn Fn(&DocId, &PeerContext<'_>) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct Rules {
    can_reveal: Option<DocRule>,
    can_update: Option<DocRule>,
    can_delete: Option<DocRule>,
    can_create: Option<CreateRule>,
}

impl Rules {
    /// Allow everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_can_reveal<F>(mut self, rule: F) -> Self
    where
        F: Fn(&DocContext<'_>, &PeerContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.can_reveal = Some(Arc::new(rule));
        self
    }

    pub fn with_can_update<F>(mut self, rule: F) -> Self
    where
        F: Fn(&DocContext<'_>, &PeerContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.can_update = Some(Arc::new(rule));
        self
    }

    pub fn with_can_delete<F>(mut self, rule: F) -> Self
    where
        F: Fn(&DocContext<'_>, &PeerContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.can_delete = Some(Arc::new(rule));
        self
    }

    pub fn with_can_create<F>(mut self, rule: F) -> Self
    where
        F: Fn(&DocId, &PeerContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.can_create = Some(Arc::new(rule));
        self
    }

    pub fn can_reveal(&self, doc: &DocContext<'_>, peer: &PeerContext<'_>) -> bool {
        self.can_reveal.as_ref().map_or(true, |rule| rule(doc, peer))
    }

    pub fn can_update(&self, doc: &DocContext<'_>, peer: &PeerContext<'_>) -> bool {
        self.can_update.as_ref().map_or(true, |rule| rule(doc, peer))
    }

    pub fn can_delete(&self, doc: &DocContext<'_>, peer: &PeerContext<'_>) -> bool {
        self.can_delete.as_ref().map_or(true, |rule| rule(doc, peer))
    }

    pub fn can_create(&self, doc_id: &DocId, peer: &PeerContext<'_>) -> bool {
        self.can_create.as_ref().map_or(true, |rule| rule(doc_id, peer))
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rules")
            .field("can_reveal", &self.can_reveal.is_some())
            .field("can_update", &self.can_update.is_some())
            .field("can_delete", &self.can_delete.is_some())
            .field("can_create", &self.can_create.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_doc::{MemoryDoc, PeerId};
    use crate::core_sync::types::PeerKind;

    fn peer() -> PeerIdentity {
        PeerIdentity::new(PeerId::new("p2"), "Bob", PeerKind::User)
    }

    #[test]
    fn test_defaults_allow() {
        let rules = Rules::new();
        let doc_id = DocId::new("doc1");
        let doc: DocHandle = Arc::new(MemoryDoc::new(PeerId::new("me")));
        let identity = peer();
        let doc_ctx = DocContext {
            doc_id: &doc_id,
            doc: &doc,
        };
        let peer_ctx = PeerContext {
            channel_id: ChannelId(1),
            channel_kind: ChannelKind::Network,
            identity: &identity,
        };

        assert!(rules.can_reveal(&doc_ctx, &peer_ctx));
        assert!(rules.can_update(&doc_ctx, &peer_ctx));
        assert!(rules.can_delete(&doc_ctx, &peer_ctx));
        assert!(rules.can_create(&doc_id, &peer_ctx));
    }

    #[test]
    fn test_predicates_see_doc_and_peer() {
        let rules = Rules::new()
            .with_can_reveal(|doc, _| doc.doc_id.as_str() != "secret")
            .with_can_update(|_, peer| peer.channel_kind == ChannelKind::Storage)
            .with_can_create(|doc_id, peer| doc_id.as_str().starts_with(peer.identity.name.as_str()));

        let secret = DocId::new("secret");
        let doc: DocHandle = Arc::new(MemoryDoc::new(PeerId::new("me")));
        let identity = peer();
        let peer_ctx = PeerContext {
            channel_id: ChannelId(1),
            channel_kind: ChannelKind::Network,
            identity: &identity,
        };
        let doc_ctx = DocContext {
            doc_id: &secret,
            doc: &doc,
        };

        assert!(!rules.can_reveal(&doc_ctx, &peer_ctx));
        assert!(!rules.can_update(&doc_ctx, &peer_ctx));
        assert!(rules.can_delete(&doc_ctx, &peer_ctx));
        assert!(rules.can_create(&DocId::new("Bob-notes"), &peer_ctx));
        assert!(!rules.can_create(&DocId::new("Carol-notes"), &peer_ctx));
        assert_eq!(
            format!("{:?}", rules),
            "Rules { can_reveal: true, can_update: true, can_delete: false, can_create: true }"
        );
    }
}
