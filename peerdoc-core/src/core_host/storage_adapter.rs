/*
    Storage adapter - A storage backend that speaks the sync protocol

    The adapter behaves like a passive peer behind a channel:
    - answers the handshake with a service identity
    - lists stored documents on directory-request
    - answers sync-request from stored chunks, and asks back when the
      requester holds something it lacks
    - saves every snapshot/update it receives
    - drops a document's range on delete-request

    Layout:
        [doc_id, "update", <version marker>]  one chunk per received payload
        [doc_id, "snapshot"]                  compacted state

    Chunks are opaque document exports. To answer a request the adapter
    rebuilds a replica by importing them, so it needs a DocumentFactory.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelSink};
use super::errors::{HostError, HostResult, StorageError};
use super::storage::{Storage, StorageKey};
use crate::core_doc::{
    DocHandle, DocId, Document, DocumentFactory, ExportMode, VersionOrder, VersionVector,
};
use crate::core_sync::handlers::sync::build_transmission;
use crate::core_sync::{ChannelMsg, PeerIdentity, Transmission};

const UPDATE_SEGMENT: &str = "update";
const SNAPSHOT_SEGMENT: &str = "snapshot";

/// One stored payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    version: VersionVector,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StorageAdapterConfig {
    /// Name announced during the handshake
    pub name: String,
    /// Update chunks per document before they are folded into one snapshot
    pub compact_after: usize,
}

impl Default for StorageAdapterConfig {
    fn default() -> Self {
        StorageAdapterConfig {
            name: "storage".to_string(),
            compact_after: 32,
        }
    }
}

/// Channel endpoint backed by a [`Storage`]
#[derive(Debug)]
pub struct StorageAdapter {
    channel_id: crate::core_sync::ChannelId,
    inbox: mpsc::UnboundedSender<ChannelMsg>,
    task: AbortHandle,
}

impl StorageAdapter {
    /// Start the worker task and return the host-facing endpoint
    pub fn spawn(
        sink: ChannelSink,
        storage: Arc<dyn Storage>,
        factory: Arc<dyn DocumentFactory>,
        config: StorageAdapterConfig,
    ) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let channel_id = sink.channel_id();
        let worker = StorageWorker {
            identity: PeerIdentity::service(config.name.clone()),
            sink,
            storage,
            factory,
            config,
        };
        let task = tokio::spawn(worker.run(rx)).abort_handle();
        StorageAdapter {
            channel_id,
            inbox,
            task,
        }
    }
}

#[async_trait]
impl Channel for StorageAdapter {
    async fn send(&self, message: ChannelMsg) -> HostResult<()> {
        self.inbox.send(message).map_err(|_| HostError::Send {
            channel_id: self.channel_id,
            reason: "storage worker stopped".to_string(),
        })
    }

    async fn stop(&self) {
        self.task.abort();
    }
}

struct StorageWorker {
    identity: PeerIdentity,
    sink: ChannelSink,
    storage: Arc<dyn Storage>,
    factory: Arc<dyn DocumentFactory>,
    config: StorageAdapterConfig,
}

impl StorageWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ChannelMsg>) {
        while let Some(message) = rx.recv().await {
            let kind = message.kind();
            if let Err(e) = self.handle(message).await {
                warn!(channel = %self.sink.channel_id(), kind, error = %e, "storage adapter failed");
                if matches!(e, HostError::Closed) {
                    break;
                }
                // Reported, not fatal: the channel stays usable
                let _ = self.sink.fail(e.to_string());
            }
        }
        debug!(channel = %self.sink.channel_id(), "storage worker stopped");
    }

    async fn handle(&self, message: ChannelMsg) -> HostResult<()> {
        let messages = match message {
            ChannelMsg::Batch { messages } => messages,
            other => vec![other],
        };
        for message in messages {
            self.handle_one(message).await?;
        }
        Ok(())
    }

    async fn handle_one(&self, message: ChannelMsg) -> HostResult<()> {
        match message {
            ChannelMsg::EstablishRequest { identity } => {
                info!(peer = %identity.peer_id, "storage channel established");
                self.reply(ChannelMsg::EstablishResponse {
                    identity: self.identity.clone(),
                })
                .await
            }
            ChannelMsg::DirectoryRequest => {
                let doc_ids = self.doc_ids().await?;
                self.reply(ChannelMsg::DirectoryResponse { doc_ids }).await
            }
            ChannelMsg::SyncRequest {
                doc_id,
                requester_version,
                bidirectional,
                ..
            } => self.answer_sync(doc_id, requester_version, bidirectional).await,
            ChannelMsg::SyncResponse {
                doc_id,
                transmission,
                ..
            } => match transmission {
                Transmission::Snapshot { data, version } | Transmission::Update { data, version } => {
                    self.save_chunk(&doc_id, version, data).await
                }
                Transmission::UpToDate { .. } | Transmission::Unavailable => Ok(()),
            },
            ChannelMsg::DeleteRequest { doc_id } => {
                self.storage.remove_range(&[doc_id.0.clone()]).await?;
                info!(doc = %doc_id, "document removed from storage");
                self.reply(ChannelMsg::DeleteResponse { doc_id, ok: true })
                    .await
            }
            other => {
                debug!(kind = other.kind(), "storage adapter ignoring message");
                Ok(())
            }
        }
    }

    async fn reply(&self, message: ChannelMsg) -> HostResult<()> {
        self.sink.deliver(message).await
    }

    async fn doc_ids(&self) -> HostResult<Vec<DocId>> {
        let entries = self.storage.load_range(&[]).await?;
        let ids: BTreeSet<String> = entries
            .into_iter()
            .filter_map(|(key, _)| key.into_iter().next())
            .collect();
        Ok(ids.into_iter().map(DocId).collect())
    }

    async fn load_chunks(&self, doc_id: &DocId) -> HostResult<Vec<(StorageKey, StoredChunk)>> {
        let entries = self.storage.load_range(&[doc_id.0.clone()]).await?;
        let mut chunks = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            let chunk: StoredChunk =
                bincode::deserialize(&bytes).map_err(|e| StorageError::Corrupt {
                    key: key.join("/"),
                    reason: e.to_string(),
                })?;
            chunks.push((key, chunk));
        }
        Ok(chunks)
    }

    /// Rebuild a replica from stored chunks; `None` when nothing is stored
    async fn materialize(&self, doc_id: &DocId) -> HostResult<Option<DocHandle>> {
        let mut remaining: Vec<StoredChunk> = self
            .load_chunks(doc_id)
            .await?
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect();
        if remaining.is_empty() {
            return Ok(None);
        }

        let doc = self.factory.create(doc_id, &self.identity.peer_id);
        // Chunks are stored in key order, not causal order
        loop {
            let before = remaining.len();
            remaining.retain(|chunk| doc.import(&chunk.data).is_err());
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }
        if !remaining.is_empty() {
            warn!(doc = %doc_id, unapplied = remaining.len(), "stored chunks could not be applied");
        }
        Ok(Some(doc))
    }

    async fn answer_sync(
        &self,
        doc_id: DocId,
        requester_version: VersionVector,
        bidirectional: bool,
    ) -> HostResult<()> {
        let Some(doc) = self.materialize(&doc_id).await? else {
            debug!(doc = %doc_id, "nothing stored");
            self.reply(ChannelMsg::SyncResponse {
                doc_id: doc_id.clone(),
                transmission: Transmission::Unavailable,
                presence: None,
            })
            .await?;
            if bidirectional {
                return self.request(doc_id, VersionVector::new()).await;
            }
            return Ok(());
        };

        let local = doc.version();
        let transmission = build_transmission(&doc, &local, &requester_version).map_err(|e| {
            StorageError::Corrupt {
                key: doc_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(doc = %doc_id, transmission = transmission.kind(), "answering from storage");
        self.reply(ChannelMsg::SyncResponse {
            doc_id: doc_id.clone(),
            transmission,
            presence: None,
        })
        .await?;

        if bidirectional
            && matches!(
                local.compare(&requester_version),
                VersionOrder::Less | VersionOrder::Concurrent
            )
        {
            self.request(doc_id, local).await?;
        }
        Ok(())
    }

    async fn request(&self, doc_id: DocId, version: VersionVector) -> HostResult<()> {
        self.reply(ChannelMsg::SyncRequest {
            doc_id,
            requester_version: version,
            bidirectional: false,
            presence: None,
        })
        .await
    }

    async fn save_chunk(&self, doc_id: &DocId, version: VersionVector, data: Vec<u8>) -> HostResult<()> {
        let key = vec![
            doc_id.0.clone(),
            UPDATE_SEGMENT.to_string(),
            version.marker(),
        ];
        let bytes = encode_chunk(&key, &StoredChunk { version, data })?;
        self.storage.save(key, bytes).await?;

        let updates = self
            .storage
            .load_range(&[doc_id.0.clone(), UPDATE_SEGMENT.to_string()])
            .await?
            .len();
        if updates >= self.config.compact_after {
            self.compact(doc_id).await?;
        }
        Ok(())
    }

    /// Fold every chunk of a document into one snapshot
    async fn compact(&self, doc_id: &DocId) -> HostResult<()> {
        let Some(doc) = self.materialize(doc_id).await? else {
            return Ok(());
        };
        let data = doc
            .export(&ExportMode::Snapshot)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let key = vec![doc_id.0.clone(), SNAPSHOT_SEGMENT.to_string()];
        let bytes = encode_chunk(
            &key,
            &StoredChunk {
                version: doc.version(),
                data,
            },
        )?;

        self.storage.remove_range(&[doc_id.0.clone()]).await?;
        self.storage.save(key, bytes).await?;
        info!(doc = %doc_id, "compacted stored chunks");
        Ok(())
    }
}

fn encode_chunk(key: &StorageKey, chunk: &StoredChunk) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(chunk).map_err(|e| StorageError::Corrupt {
        key: key.join("/"),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_doc::{MemoryDoc, MemoryDocFactory, PeerId};
    use crate::core_host::host::HostEvent;
    use crate::core_host::middleware::MiddlewareChain;
    use crate::core_host::storage::{key, MemoryStorage};
    use crate::core_sync::{ChannelId, Message};
    use serde_json::json;

    struct Harness {
        adapter: StorageAdapter,
        storage: Arc<MemoryStorage>,
        events: mpsc::UnboundedReceiver<HostEvent>,
    }

    fn harness(compact_after: usize) -> Harness {
        let (tx, events) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(ChannelId(1), tx, Arc::new(MiddlewareChain::new()));
        let storage = Arc::new(MemoryStorage::new());
        let adapter = StorageAdapter::spawn(
            sink,
            storage.clone(),
            Arc::new(MemoryDocFactory),
            StorageAdapterConfig {
                compact_after,
                ..Default::default()
            },
        );
        Harness {
            adapter,
            storage,
            events,
        }
    }

    impl Harness {
        async fn reply(&mut self) -> ChannelMsg {
            match self.events.recv().await {
                Some(HostEvent::Core(Message::ChannelReceived { message, .. })) => message,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    fn edited_doc(entries: &[(&str, i64)]) -> MemoryDoc {
        let doc = MemoryDoc::new(PeerId::new("alice"));
        for (k, v) in entries {
            doc.set(k, json!(v)).unwrap();
        }
        doc
    }

    fn snapshot_of(doc: &MemoryDoc) -> ChannelMsg {
        ChannelMsg::SyncResponse {
            doc_id: DocId::new("doc1"),
            transmission: Transmission::Snapshot {
                data: doc.export(&ExportMode::Snapshot).unwrap(),
                version: doc.version(),
            },
            presence: None,
        }
    }

    fn request(version: VersionVector, bidirectional: bool) -> ChannelMsg {
        ChannelMsg::SyncRequest {
            doc_id: DocId::new("doc1"),
            requester_version: version,
            bidirectional,
            presence: None,
        }
    }

    #[tokio::test]
    async fn test_handshake_and_empty_directory() {
        let mut h = harness(32);
        h.adapter
            .send(ChannelMsg::EstablishRequest {
                identity: PeerIdentity::user("alice"),
            })
            .await
            .unwrap();
        let ChannelMsg::EstablishResponse { identity } = h.reply().await else {
            panic!("expected establish-response");
        };
        assert_eq!(identity.kind, crate::core_sync::PeerKind::Service);

        h.adapter.send(ChannelMsg::DirectoryRequest).await.unwrap();
        assert_eq!(
            h.reply().await,
            ChannelMsg::DirectoryResponse { doc_ids: vec![] }
        );
    }

    #[tokio::test]
    async fn test_missing_document_asks_back() {
        let mut h = harness(32);
        h.adapter
            .send(request(VersionVector::new(), true))
            .await
            .unwrap();
        assert!(matches!(
            h.reply().await,
            ChannelMsg::SyncResponse {
                transmission: Transmission::Unavailable,
                ..
            }
        ));
        assert_eq!(h.reply().await, request(VersionVector::new(), false));
    }

    #[tokio::test]
    async fn test_saved_snapshot_is_served_back() {
        let mut h = harness(32);
        let source = edited_doc(&[("a", 1), ("b", 2)]);
        h.adapter.send(snapshot_of(&source)).await.unwrap();
        h.adapter.send(ChannelMsg::DirectoryRequest).await.unwrap();
        assert_eq!(
            h.reply().await,
            ChannelMsg::DirectoryResponse {
                doc_ids: vec![DocId::new("doc1")]
            }
        );

        h.adapter
            .send(request(VersionVector::new(), false))
            .await
            .unwrap();
        let ChannelMsg::SyncResponse {
            transmission: Transmission::Snapshot { data, version },
            ..
        } = h.reply().await
        else {
            panic!("expected snapshot");
        };
        assert_eq!(version, source.version());
        let replica = MemoryDoc::new(PeerId::new("bob"));
        replica.import(&data).unwrap();
        assert_eq!(replica.entries().unwrap(), source.entries().unwrap());

        // Same version: nothing to send
        h.adapter
            .send(request(source.version(), true))
            .await
            .unwrap();
        assert!(matches!(
            h.reply().await,
            ChannelMsg::SyncResponse {
                transmission: Transmission::UpToDate { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requester_ahead_gets_reciprocal_request() {
        let mut h = harness(32);
        let source = edited_doc(&[("a", 1)]);
        h.adapter.send(snapshot_of(&source)).await.unwrap();
        let stored = source.version();
        source.set("b", json!(2)).unwrap();

        h.adapter
            .send(request(source.version(), true))
            .await
            .unwrap();
        assert!(matches!(
            h.reply().await,
            ChannelMsg::SyncResponse {
                transmission: Transmission::UpToDate { .. },
                ..
            }
        ));
        assert_eq!(h.reply().await, request(stored, false));
    }

    #[tokio::test]
    async fn test_updates_are_compacted() {
        let h = harness(2);
        let source = edited_doc(&[("a", 1)]);
        h.adapter.send(snapshot_of(&source)).await.unwrap();

        let base = source.version();
        source.set("b", json!(2)).unwrap();
        h.adapter
            .send(ChannelMsg::SyncResponse {
                doc_id: DocId::new("doc1"),
                transmission: Transmission::Update {
                    data: source.export(&ExportMode::Update { from: base }).unwrap(),
                    version: source.version(),
                },
                presence: None,
            })
            .await
            .unwrap();

        let storage = h.storage.clone();
        let compacted = crate::test_utils::with_timeout(std::time::Duration::from_secs(1), async {
            loop {
                if storage.load(&key(&["doc1", "snapshot"])).await.unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(compacted.is_some());
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_range() {
        let mut h = harness(32);
        h.adapter
            .send(snapshot_of(&edited_doc(&[("a", 1)])))
            .await
            .unwrap();
        h.adapter
            .send(ChannelMsg::DeleteRequest {
                doc_id: DocId::new("doc1"),
            })
            .await
            .unwrap();
        assert_eq!(
            h.reply().await,
            ChannelMsg::DeleteResponse {
                doc_id: DocId::new("doc1"),
                ok: true
            }
        );
        assert!(h.storage.is_empty().await);
    }
}
