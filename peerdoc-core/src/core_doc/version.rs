/*
    version.rs - Version vectors for document causality

    A version vector maps each peer that has edited a document to the highest
    contiguous operation counter known from it. Comparing two vectors tells
    the sync protocol whether to send a snapshot, an incremental update,
    nothing at all, or to ask for data in return:
    - Equal:      nothing to exchange
    - Less:       we are behind
    - Greater:    we are ahead
    - Concurrent: both sides have something the other lacks
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Relationship between two version vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Equal,
    Less,
    Greater,
    Concurrent,
}

/// Per-peer operation counters identifying a point in a document's history
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    counters: BTreeMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        VersionVector {
            counters: BTreeMap::new(),
        }
    }

    /// Counter for a peer, zero when the peer never edited
    pub fn get(&self, peer: &str) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    /// Set the counter for a peer; zero removes the entry
    pub fn set(&mut self, peer: &str, counter: u64) {
        if counter == 0 {
            self.counters.remove(peer);
        } else {
            self.counters.insert(peer.to_string(), counter);
        }
    }

    /// Bump a peer's counter and return the new value
    pub fn increment(&mut self, peer: &str) -> u64 {
        let counter = self.counters.entry(peer.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VersionVector) {
        for (peer, &counter) in &other.counters {
            let current = self.counters.entry(peer.clone()).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    pub fn compare(&self, other: &VersionVector) -> VersionOrder {
        let mut less = false;
        let mut greater = false;

        for peer in self.counters.keys().chain(other.counters.keys()) {
            match self.get(peer).cmp(&other.get(peer)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return VersionOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => VersionOrder::Equal,
            (true, false) => VersionOrder::Less,
            (false, true) => VersionOrder::Greater,
            (true, true) => VersionOrder::Concurrent,
        }
    }

    /// True when every operation in `other` is also covered by `self`
    pub fn includes(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            VersionOrder::Equal | VersionOrder::Greater
        )
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(peer, &counter)| (peer.as_str(), counter))
    }

    /// Stable textual marker, used as a storage key component
    pub fn marker(&self) -> String {
        if self.counters.is_empty() {
            return "empty".to_string();
        }
        self.counters
            .iter()
            .map(|(peer, counter)| format!("{}@{}", peer, counter))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            VersionOrder::Equal => Some(Ordering::Equal),
            VersionOrder::Less => Some(Ordering::Less),
            VersionOrder::Greater => Some(Ordering::Greater),
            VersionOrder::Concurrent => None,
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.marker())
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut vv = VersionVector::new();
        for (peer, counter) in iter {
            vv.set(&peer.into(), counter);
        }
        vv
    }
}
