/*
    memory_doc.rs - In-memory reference document

    A last-writer-wins map built from an operation log. Every local write is
    an operation identified by (peer, counter); counters per peer are
    contiguous, so the version vector of a replica is simply the highest
    counter seen from each peer. Conflicts on the same key are resolved by
    (lamport, peer), which makes every replica converge regardless of the
    order operations arrive in.

    Export format is a JSON array of operations.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::document::{DocHandle, Document, DocumentFactory, ExportMode, LocalChangeListener};
use super::errors::{DocResult, DocumentError};
use super::ids::{DocId, PeerId};
use super::version::VersionVector;

fn handle_poison<T>(_err: PoisonError<T>) -> DocumentError {
    DocumentError::Poisoned
}

/// A single write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub peer: String,
    pub counter: u64,
    pub lamport: u64,
    pub key: String,
    /// `None` deletes the key
    pub value: Option<serde_json::Value>,
}

#[derive(Default)]
struct Inner {
    ops: BTreeMap<(String, u64), Op>,
    version: VersionVector,
    lamport: u64,
}

pub struct MemoryDoc {
    peer_id: PeerId,
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<LocalChangeListener>>,
}

impl MemoryDoc {
    pub fn new(peer_id: PeerId) -> Self {
        MemoryDoc {
            peer_id,
            inner: RwLock::new(Inner::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Write a key locally and notify listeners
    pub fn set(&self, key: &str, value: serde_json::Value) -> DocResult<()> {
        self.write(key, Some(value))
    }

    pub fn delete(&self, key: &str) -> DocResult<()> {
        self.write(key, None)
    }

    fn write(&self, key: &str, value: Option<serde_json::Value>) -> DocResult<()> {
        {
            let mut inner = self.inner.write().map_err(handle_poison)?;
            let peer = self.peer_id.as_str().to_string();
            let counter = inner.version.increment(&peer);
            inner.lamport += 1;
            let op = Op {
                peer: peer.clone(),
                counter,
                lamport: inner.lamport,
                key: key.to_string(),
                value,
            };
            inner.ops.insert((peer, counter), op);
        }

        // Listeners run outside the state lock so they may read the document
        let listeners = self.listeners.read().map_err(handle_poison)?;
        for listener in listeners.iter() {
            listener();
        }
        Ok(())
    }

    /// Current value of a key
    pub fn get(&self, key: &str) -> DocResult<Option<serde_json::Value>> {
        let inner = self.inner.read().map_err(handle_poison)?;
        Ok(Self::winner(&inner, key).and_then(|op| op.value.clone()))
    }

    /// Materialized key/value view
    pub fn entries(&self) -> DocResult<BTreeMap<String, serde_json::Value>> {
        let inner = self.inner.read().map_err(handle_poison)?;
        let mut winners: HashMap<&str, &Op> = HashMap::new();
        for op in inner.ops.values() {
            let replace = match winners.get(op.key.as_str()) {
                Some(current) => (op.lamport, &op.peer) > (current.lamport, &current.peer),
                None => true,
            };
            if replace {
                winners.insert(op.key.as_str(), op);
            }
        }
        Ok(winners
            .into_iter()
            .filter_map(|(key, op)| op.value.clone().map(|v| (key.to_string(), v)))
            .collect())
    }

    fn winner<'a>(inner: &'a Inner, key: &str) -> Option<&'a Op> {
        inner
            .ops
            .values()
            .filter(|op| op.key == key)
            .max_by(|a, b| (a.lamport, &a.peer).cmp(&(b.lamport, &b.peer)))
    }
}

impl fmt::Debug for MemoryDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self.version();
        f.debug_struct("MemoryDoc")
            .field("peer_id", &self.peer_id)
            .field("version", &version)
            .finish()
    }
}

impl Document for MemoryDoc {
    fn version(&self) -> VersionVector {
        match self.inner.read() {
            Ok(inner) => inner.version.clone(),
            Err(poisoned) => poisoned.into_inner().version.clone(),
        }
    }

    fn export(&self, mode: &ExportMode) -> DocResult<Vec<u8>> {
        let inner = self.inner.read().map_err(handle_poison)?;
        let ops: Vec<&Op> = match mode {
            ExportMode::Snapshot => inner.ops.values().collect(),
            ExportMode::Update { from } => inner
                .ops
                .values()
                .filter(|op| op.counter > from.get(&op.peer))
                .collect(),
        };
        serde_json::to_vec(&ops).map_err(|e| DocumentError::Encode(e.to_string()))
    }

    fn import(&self, bytes: &[u8]) -> DocResult<VersionVector> {
        let mut ops: Vec<Op> =
            serde_json::from_slice(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        ops.sort_by(|a, b| (&a.peer, a.counter).cmp(&(&b.peer, b.counter)));

        let mut inner = self.inner.write().map_err(handle_poison)?;

        // Validate the whole batch before touching state
        let mut next = inner.version.clone();
        for op in &ops {
            let have = next.get(&op.peer);
            if op.counter <= have {
                continue;
            }
            if op.counter != have + 1 {
                return Err(DocumentError::MissingDependencies {
                    peer: op.peer.clone(),
                    expected: have + 1,
                    found: op.counter,
                });
            }
            next.set(&op.peer, op.counter);
        }

        for op in ops {
            if op.counter <= inner.version.get(&op.peer) {
                continue;
            }
            inner.lamport = inner.lamport.max(op.lamport);
            inner.version.set(&op.peer, op.counter);
            inner.ops.insert((op.peer.clone(), op.counter), op);
        }

        Ok(inner.version.clone())
    }

    fn subscribe_local(&self, listener: LocalChangeListener) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }
}

/// Factory producing empty [`MemoryDoc`] replicas owned by the local peer
#[derive(Debug, Clone, Default)]
pub struct MemoryDocFactory;

impl DocumentFactory for MemoryDocFactory {
    fn create(&self, _doc_id: &DocId, local_peer: &PeerId) -> DocHandle {
        Arc::new(MemoryDoc::new(local_peer.clone()))
    }
}

/// Factory that also keeps every replica it creates, so callers can edit
/// documents through the concrete type
#[derive(Debug, Default)]
pub struct MemoryDocRegistry {
    docs: Mutex<HashMap<DocId, Arc<MemoryDoc>>>,
}

impl MemoryDocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest replica created for `doc_id`
    pub fn doc(&self, doc_id: &DocId) -> Option<Arc<MemoryDoc>> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(doc_id)
            .cloned()
    }
}

impl DocumentFactory for MemoryDocRegistry {
    fn create(&self, doc_id: &DocId, local_peer: &PeerId) -> DocHandle {
        let doc = Arc::new(MemoryDoc::new(local_peer.clone()));
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc_id.clone(), doc.clone());
        doc
    }
}
