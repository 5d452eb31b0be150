/*
    types.rs - Common types for the sync engine

    Defines:
    - Channel ids and kinds
    - Peer identity
    - Wall-clock timestamps carried by messages
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::core_doc::{DocId, PeerId};

/// Host-assigned channel identifier; never reused after removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// What sits behind a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Storage,
    Network,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerKind {
    User,
    Bot,
    Service,
}

/// Self-description exchanged during establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub name: String,
    pub kind: PeerKind,
}

impl PeerIdentity {
    pub fn new(peer_id: PeerId, name: impl Into<String>, kind: PeerKind) -> Self {
        PeerIdentity {
            peer_id,
            name: name.into(),
            kind,
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), name, PeerKind::User)
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), name, PeerKind::Service)
    }
}

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time; only the host calls this
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, zero if the clock went backwards
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_since_saturates() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(1_500);
        assert_eq!(b.millis_since(a), 500);
        assert_eq!(a.millis_since(b), 0);
    }

    #[test]
    fn test_identity_wire_shape() {
        let id = PeerIdentity::new(PeerId::new("p1"), "Alice", PeerKind::User);
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["peer_id"], "p1");
        assert_eq!(json["kind"], "user");
    }
}
