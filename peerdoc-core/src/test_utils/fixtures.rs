//! Test fixtures
//!
//! Builders for identities and models. Models are backed by a
//! [`MemoryDocRegistry`] so tests can edit and inspect every replica.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{PresenceConfig, SyncConfig};
use crate::core_doc::{MemoryDocRegistry, PeerId};
use crate::core_sync::{Model, PeerIdentity, PeerKind, Rules};

/// Builder for peer identities with predictable ids
pub struct TestPeerBuilder {
    peer_id: String,
    name: Option<String>,
    kind: PeerKind,
}

impl TestPeerBuilder {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: None,
            kind: PeerKind::User,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: PeerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn build(self) -> PeerIdentity {
        let name = self.name.unwrap_or_else(|| self.peer_id.clone());
        PeerIdentity::new(PeerId::new(self.peer_id), name, self.kind)
    }
}

/// Sync timing short enough for tests that advance time
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        request_timeout: Duration::from_millis(100),
        max_retries: 2,
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
    }
}

pub fn fast_presence_config() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval: Duration::from_millis(100),
        expiry: None,
        sweep_interval: None,
    }
}

/// Builder for synchronizer models backed by a [`MemoryDocRegistry`]
pub struct TestModelBuilder {
    identity: PeerIdentity,
    rules: Rules,
    sync: SyncConfig,
    presence: PresenceConfig,
}

impl TestModelBuilder {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            identity: TestPeerBuilder::new(peer_id).build(),
            rules: Rules::new(),
            sync: SyncConfig::default(),
            presence: PresenceConfig::default(),
        }
    }

    pub fn with_identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync = config;
        self
    }

    pub fn with_presence_config(mut self, config: PresenceConfig) -> Self {
        self.presence = config;
        self
    }

    pub fn build(self) -> (Model, Arc<MemoryDocRegistry>) {
        let factory = Arc::new(MemoryDocRegistry::new());
        let model = Model::new(self.identity, factory.clone())
            .with_rules(self.rules)
            .with_sync_config(self.sync)
            .with_presence_config(self.presence);
        (model, factory)
    }
}
