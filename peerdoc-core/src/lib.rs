//! peerdoc - CRDT document synchronization
//!
//! `core_sync` is the pure synchronizer, `core_host` runs it on tokio and
//! talks to transports and storage, `core_doc` defines what a document
//! looks like to both.

pub mod config;
pub mod core_doc;
pub mod core_host;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::Config;
pub use core_doc::{DocHandle, DocId, Document, MemoryDoc, PeerId, VersionVector};
pub use core_host::{MemoryBridge, MemoryStorage, SyncHost, SyncHostBuilder};
pub use core_sync::{update, ChannelMsg, Command, Message, Model, PeerIdentity, Rules};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
        let _ = DocId::new("doc1");
    }
}
