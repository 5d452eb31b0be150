/*
    core_sync - Document synchronizer

    A pure state machine: `update(model, message) -> (model, commands)`.
    Inputs arrive as `Message`s (channel traffic, local edits, timer
    expiries, import results); every side effect leaves as a `Command` for
    the host to execute.

    Protocol per channel:
    1. establish-request / establish-response exchange identities
    2. the initiator pulls the directory and syncs each revealed document
    3. sync-request / sync-response move snapshots and updates
    4. local edits are pushed to channels known to hold the document
    5. presence travels alongside, relayed at most a bounded number of hops
*/

pub mod command;
pub mod message;
pub mod model;
pub mod presence;
pub mod retry;
pub mod rules;
pub mod types;
pub mod update;
pub mod wire;

pub(crate) mod handlers;

#[cfg(test)]
mod tests;

pub use command::Command;
pub use message::Message;
pub use model::{
    Awareness, Channel, ChannelDocState, ConnectionState, DocumentState, LoadingState, Model,
    PeerState, PendingRequest, RequestKey, RequestKind,
};
pub use presence::{PresenceEntry, PresenceError, PresenceRecord, PresenceStore};
pub use retry::backoff_delay;
pub use rules::{DocContext, PeerContext, Rules};
pub use types::{ChannelId, ChannelKind, PeerIdentity, PeerKind, Timestamp};
pub use update::{update, update_all};
pub use wire::{ChannelMsg, Transmission};
