/*
    core_host - Executes synchronizer commands on tokio

    - `SyncHost`: the actor owning the model, timers and channel endpoints
    - `Channel` / `ChannelSink`: the transport contract
    - `MiddlewareChain`: async checks on inbound messages
    - `MemoryBridge`: in-process transport between two hosts
    - `Storage` / `StorageAdapter`: persistence behind a channel
*/

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod errors;
pub mod host;
pub mod middleware;
pub mod storage;
pub mod storage_adapter;

pub use bridge::MemoryBridge;
pub use channel::{Channel, ChannelHandle, ChannelSink};
pub use codec::MAX_FRAME_SIZE;
pub use errors::{CodecError, HostError, HostResult, StorageError};
pub use host::{HostNotification, SyncHost, SyncHostBuilder};
pub use middleware::{Middleware, MiddlewareChain, RateLimit, Verdict};
pub use storage::{MemoryStorage, Storage, StorageKey};
pub use storage_adapter::{StorageAdapter, StorageAdapterConfig};
