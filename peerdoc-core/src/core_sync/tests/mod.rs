/*
    Tests for the core_sync synchronizer

    Test suite covering:
    - Reference scenarios (snapshot, reveal filter, departure, reciprocal sync)
    - Establishment, discovery, push and deletion
    - Presence relay and expiry
    - Deadlines and retries
    - Properties over random input
    - Multi-peer runs on the simulated network
*/

use std::sync::Arc;

use crate::core_doc::{DocId, VersionVector};
use crate::core_sync::*;
use crate::core_doc::MemoryDocRegistry;
use crate::test_utils::{TestModelBuilder, TestPeerBuilder};

pub mod protocol_tests;
pub mod timeout_tests;

pub fn peer(id: &str) -> PeerIdentity {
    TestPeerBuilder::new(id).build()
}

pub fn doc(id: &str) -> DocId {
    DocId::new(id)
}

pub fn receive(model: Model, channel_id: ChannelId, message: ChannelMsg) -> (Model, Vec<Command>) {
    update(
        model,
        Message::ChannelReceived {
            channel_id,
            message,
        },
    )
}

/// Register a channel and let the remote side establish it
pub fn connect_peer(
    model: Model,
    channel_id: ChannelId,
    kind: ChannelKind,
    identity: PeerIdentity,
) -> Model {
    let (model, _) = update_all(
        model,
        vec![
            Message::ChannelAdded { channel_id, kind },
            Message::ChannelReceived {
                channel_id,
                message: ChannelMsg::EstablishRequest { identity },
            },
        ],
    );
    model
}

/// A model holding `doc_id` with the given entries written locally
pub fn model_with_doc(
    builder: TestModelBuilder,
    doc_id: &str,
    entries: &[(&str, serde_json::Value)],
) -> (Model, Arc<MemoryDocRegistry>) {
    let (model, factory) = builder.build();
    let (model, _) = update(model, Message::DocEnsure { doc_id: doc(doc_id) });
    let replica = factory.doc(&doc(doc_id)).expect("document created");
    for (key, value) in entries {
        replica.set(key, value.clone()).unwrap();
    }
    (model, factory)
}

pub fn sync_request(doc_id: &str, version: VersionVector, bidirectional: bool) -> ChannelMsg {
    ChannelMsg::SyncRequest {
        doc_id: doc(doc_id),
        requester_version: version,
        bidirectional,
        presence: None,
    }
}

/// Messages addressed to one channel, in order
pub fn sent_to(cmds: &[Command], channel_id: ChannelId) -> Vec<&ChannelMsg> {
    cmds.iter()
        .filter_map(|cmd| match cmd {
            Command::Send {
                channel_id: target,
                message,
            } if *target == channel_id => Some(message),
            _ => None,
        })
        .collect()
}

pub fn sends(cmds: &[Command]) -> usize {
    cmds.iter()
        .filter(|cmd| matches!(cmd, Command::Send { .. }))
        .count()
}

pub fn awareness(model: &Model, doc_id: &str, channel_id: ChannelId) -> Option<Awareness> {
    model
        .channel_doc_state(&doc(doc_id), channel_id)
        .map(|state| state.awareness)
}
