/*
    core_doc - Document handles as seen by the sync engine

    - Version vectors and their comparison
    - The opaque `Document` contract (version / export / import)
    - `MemoryDoc`, an op-log LWW map used by the host, CLI and tests
*/

pub mod document;
pub mod errors;
pub mod ids;
pub mod memory_doc;
pub mod version;

pub use document::{DocHandle, Document, DocumentFactory, ExportMode, LocalChangeListener};
pub use errors::{DocResult, DocumentError};
pub use ids::{DocId, PeerId};
pub use memory_doc::{MemoryDoc, MemoryDocFactory, MemoryDocRegistry, Op};
pub use version::{VersionOrder, VersionVector};
