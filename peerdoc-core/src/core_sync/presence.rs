/*
    presence.rs - Ephemeral per-document presence

    Entries are keyed by (doc, peer, namespace) and carry opaque bytes plus
    the timestamp of the write. Merging is last-write-wins on the timestamp.
    A record with no value is a tombstone: it deletes an entry that is not
    newer than itself and is never stored.

    Wire data for a presence message is a bincode-encoded `Vec<PresenceRecord>`.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

use super::types::{DocId, PeerId, Timestamp};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Presence codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for PresenceError {
    fn from(err: bincode::Error) -> Self {
        PresenceError::Codec(err.to_string())
    }
}

/// A stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

/// One entry as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub namespace: String,
    pub value: Option<Vec<u8>>,
    pub timestamp: Timestamp,
}

pub fn encode_records(records: &[PresenceRecord]) -> Result<Vec<u8>, PresenceError> {
    Ok(bincode::serialize(records)?)
}

pub fn decode_records(bytes: &[u8]) -> Result<Vec<PresenceRecord>, PresenceError> {
    Ok(bincode::deserialize(bytes)?)
}

type DocPresence = BTreeMap<(PeerId, String), PresenceEntry>;

#[derive(Debug, Clone, Default)]
pub struct PresenceStore {
    docs: HashMap<DocId, DocPresence>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, doc_id: &DocId, peer_id: &PeerId, namespace: &str) -> Option<&PresenceEntry> {
        self.docs
            .get(doc_id)
            .and_then(|entries| entries.get(&(peer_id.clone(), namespace.to_string())))
    }

    /// Apply one record; returns whether the store changed
    pub fn apply(&mut self, doc_id: &DocId, record: PresenceRecord) -> bool {
        let key = (record.peer_id, record.namespace);
        let entries = self.docs.entry(doc_id.clone()).or_default();

        let changed = match record.value {
            Some(value) => {
                let newer = entries
                    .get(&key)
                    .map_or(true, |existing| record.timestamp > existing.timestamp);
                if newer {
                    entries.insert(
                        key,
                        PresenceEntry {
                            value,
                            timestamp: record.timestamp,
                        },
                    );
                }
                newer
            }
            None => {
                let covered = entries
                    .get(&key)
                    .map_or(false, |existing| record.timestamp >= existing.timestamp);
                if covered {
                    entries.remove(&key);
                }
                covered
            }
        };

        if entries.is_empty() {
            self.docs.remove(doc_id);
        }
        changed
    }

    pub fn apply_all(&mut self, doc_id: &DocId, records: Vec<PresenceRecord>) -> bool {
        records
            .into_iter()
            .fold(false, |changed, record| self.apply(doc_id, record) || changed)
    }

    /// Every entry of a document
    pub fn records(&self, doc_id: &DocId) -> Vec<PresenceRecord> {
        self.records_matching(doc_id, |_| true)
    }

    /// Entries of one peer in a document
    pub fn records_for_peer(&self, doc_id: &DocId, peer_id: &PeerId) -> Vec<PresenceRecord> {
        self.records_matching(doc_id, |p| p == peer_id)
    }

    fn records_matching(
        &self,
        doc_id: &DocId,
        keep: impl Fn(&PeerId) -> bool,
    ) -> Vec<PresenceRecord> {
        self.docs
            .get(doc_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|((peer_id, _), _)| keep(peer_id))
                    .map(|((peer_id, namespace), entry)| PresenceRecord {
                        peer_id: peer_id.clone(),
                        namespace: namespace.clone(),
                        value: Some(entry.value.clone()),
                        timestamp: entry.timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Documents that currently hold at least one entry, sorted
    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Delete all entries of a peer; returns the tombstones per document
    pub fn remove_peer(
        &mut self,
        peer_id: &PeerId,
        now: Timestamp,
    ) -> Vec<(DocId, Vec<PresenceRecord>)> {
        let mut removed = Vec::new();
        for doc_id in self.doc_ids() {
            let tombstones: Vec<PresenceRecord> = self
                .records_for_peer(&doc_id, peer_id)
                .into_iter()
                .map(|record| PresenceRecord {
                    value: None,
                    timestamp: now.max(record.timestamp),
                    ..record
                })
                .collect();
            if tombstones.is_empty() {
                continue;
            }
            self.apply_all(&doc_id, tombstones.clone());
            removed.push((doc_id, tombstones));
        }
        removed
    }

    /// Bump the timestamps of a peer's entries
    pub fn refresh_peer(&mut self, peer_id: &PeerId, now: Timestamp) {
        for entries in self.docs.values_mut() {
            for ((owner, _), entry) in entries.iter_mut() {
                if owner == peer_id && entry.timestamp < now {
                    entry.timestamp = now;
                }
            }
        }
    }

    /// Drop entries older than `expiry`, except those owned by `keep`;
    /// returns the documents that changed
    pub fn sweep(&mut self, now: Timestamp, expiry: Duration, keep: &PeerId) -> Vec<DocId> {
        let window = expiry.as_millis() as u64;
        let mut changed = Vec::new();
        self.docs.retain(|doc_id, entries| {
            let before = entries.len();
            entries.retain(|(owner, _), entry| {
                owner == keep || now.millis_since(entry.timestamp) <= window
            });
            if entries.len() != before {
                changed.push(doc_id.clone());
            }
            !entries.is_empty()
        });
        changed.sort();
        changed
    }

    pub fn remove_doc(&mut self, doc_id: &DocId) -> bool {
        self.docs.remove(doc_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(peer: &str, ns: &str, value: Option<&[u8]>, ts: u64) -> PresenceRecord {
        PresenceRecord {
            peer_id: PeerId::new(peer),
            namespace: ns.to_string(),
            value: value.map(|v| v.to_vec()),
            timestamp: Timestamp::from_millis(ts),
        }
    }

    #[test]
    fn test_last_write_wins() {
        let doc = DocId::new("doc1");
        let mut store = PresenceStore::new();

        assert!(store.apply(&doc, record("a", "cursor", Some(b"1"), 10)));
        assert!(!store.apply(&doc, record("a", "cursor", Some(b"0"), 5)));
        assert!(store.apply(&doc, record("a", "cursor", Some(b"2"), 20)));

        let entry = store.get(&doc, &PeerId::new("a"), "cursor").unwrap();
        assert_eq!(entry.value, b"2".to_vec());
    }

    #[test]
    fn test_tombstone_only_deletes_older_entries() {
        let doc = DocId::new("doc1");
        let mut store = PresenceStore::new();
        store.apply(&doc, record("a", "cursor", Some(b"1"), 10));

        assert!(!store.apply(&doc, record("a", "cursor", None, 9)));
        assert!(store.get(&doc, &PeerId::new("a"), "cursor").is_some());

        assert!(store.apply(&doc, record("a", "cursor", None, 10)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_peer_returns_tombstones() {
        let mut store = PresenceStore::new();
        store.apply(&DocId::new("d1"), record("a", "cursor", Some(b"x"), 1));
        store.apply(&DocId::new("d2"), record("a", "name", Some(b"y"), 1));
        store.apply(&DocId::new("d2"), record("b", "name", Some(b"z"), 1));

        let removed = store.remove_peer(&PeerId::new("a"), Timestamp::from_millis(50));
        assert_eq!(removed.len(), 2);
        assert!(removed
            .iter()
            .all(|(_, records)| records.iter().all(|r| r.value.is_none())));
        assert_eq!(store.doc_ids(), vec![DocId::new("d2")]);
        assert_eq!(store.records(&DocId::new("d2")).len(), 1);
    }

    #[test]
    fn test_sweep_keeps_local_and_fresh_entries() {
        let doc = DocId::new("doc1");
        let mut store = PresenceStore::new();
        store.apply(&doc, record("me", "cursor", Some(b"1"), 0));
        store.apply(&doc, record("old", "cursor", Some(b"1"), 0));
        store.apply(&doc, record("fresh", "cursor", Some(b"1"), 900));

        let changed = store.sweep(
            Timestamp::from_millis(1_000),
            Duration::from_millis(500),
            &PeerId::new("me"),
        );
        assert_eq!(changed, vec![doc.clone()]);
        assert!(store.get(&doc, &PeerId::new("old"), "cursor").is_none());
        assert!(store.get(&doc, &PeerId::new("me"), "cursor").is_some());
        assert!(store.get(&doc, &PeerId::new("fresh"), "cursor").is_some());
    }

    #[test]
    fn test_refresh_peer() {
        let doc = DocId::new("doc1");
        let mut store = PresenceStore::new();
        store.apply(&doc, record("me", "cursor", Some(b"1"), 3));
        store.refresh_peer(&PeerId::new("me"), Timestamp::from_millis(40));
        let entry = store.get(&doc, &PeerId::new("me"), "cursor").unwrap();
        assert_eq!(entry.timestamp, Timestamp::from_millis(40));
    }

    #[test]
    fn test_codec() {
        let records = vec![
            record("a", "cursor", Some(b"12"), 7),
            record("b", "cursor", None, 8),
        ];
        let bytes = encode_records(&records).unwrap();
        assert_eq!(decode_records(&bytes).unwrap(), records);
        assert!(decode_records(&[0xff, 0x01]).is_err());
    }
}
