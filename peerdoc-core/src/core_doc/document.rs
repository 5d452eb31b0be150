/*
    document.rs - The document handle contract

    The sync engine never looks inside a document. It only asks for the
    current version, exports bytes for a peer, and (through the host) imports
    bytes received from a peer. Merging concurrent edits is the document's job.
*/

use std::fmt;
use std::sync::Arc;

use super::errors::DocResult;
use super::ids::{DocId, PeerId};
use super::version::VersionVector;

/// What to export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportMode {
    /// Full state, importable into an empty document
    Snapshot,
    /// Only what a holder of `from` is missing
    Update { from: VersionVector },
}

/// Callback fired after a local (not imported) change
pub type LocalChangeListener = Box<dyn Fn() + Send + Sync>;

/// An opaque CRDT document handle
pub trait Document: Send + Sync + fmt::Debug {
    /// Current frontier
    fn version(&self) -> VersionVector;

    /// Encode state for a peer
    fn export(&self, mode: &ExportMode) -> DocResult<Vec<u8>>;

    /// Merge bytes produced by `export` on another replica; returns the new version
    fn import(&self, bytes: &[u8]) -> DocResult<VersionVector>;

    /// Register a listener for local edits; imports do not fire it
    fn subscribe_local(&self, listener: LocalChangeListener);
}

pub type DocHandle = Arc<dyn Document>;

/// Creates empty handles for documents learned through discovery or sync
pub trait DocumentFactory: Send + Sync + fmt::Debug {
    fn create(&self, doc_id: &DocId, local_peer: &PeerId) -> DocHandle;
}
