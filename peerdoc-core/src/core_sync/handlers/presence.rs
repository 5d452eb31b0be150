//! Presence relay
//!
//! Local changes leave with one hop so direct neighbours forward them once.
//! Heartbeats carry zero hops. Relays never go back to the sender and never
//! reach storage channels.

use tracing::{debug, trace, warn};

use crate::core_sync::command::Command;
use crate::core_sync::model::Model;
use crate::core_sync::presence::{decode_records, encode_records, PresenceRecord};
use crate::core_sync::types::{ChannelId, DocId, PeerId, Timestamp};
use crate::core_sync::wire::ChannelMsg;

/// Hops given to locally originated changes
const LOCAL_HOPS: u8 = 1;

fn broadcast(
    model: &Model,
    doc_id: &DocId,
    records: &[PresenceRecord],
    hops_remaining: u8,
    exclude: Option<ChannelId>,
    cmds: &mut Vec<Command>,
) {
    if records.is_empty() {
        return;
    }
    let data = match encode_records(records) {
        Ok(data) => data,
        Err(e) => {
            warn!(doc = %doc_id, error = %e, "failed to encode presence");
            return;
        }
    };
    for channel_id in model.interested_channels(doc_id, false) {
        if Some(channel_id) == exclude {
            continue;
        }
        cmds.push(Command::send(
            channel_id,
            ChannelMsg::Presence {
                doc_id: doc_id.clone(),
                hops_remaining,
                data: data.clone(),
            },
        ));
    }
}

fn apply_records(
    model: &mut Model,
    doc_id: &DocId,
    records: Vec<PresenceRecord>,
    cmds: &mut Vec<Command>,
) {
    if model.presence.apply_all(doc_id, records) {
        cmds.push(Command::PresenceChanged {
            doc_id: doc_id.clone(),
        });
    }
}

/// Presence only flows from peers allowed to see the document
fn sender_may_see(model: &Model, doc_id: &DocId, channel_id: ChannelId) -> bool {
    match model.channel_doc_state(doc_id, channel_id) {
        Some(state) => state.can_reveal,
        None => model.evaluate_reveal(doc_id, channel_id),
    }
}

/// Merge presence piggybacked on a sync message; never relayed
pub(crate) fn apply_attached(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: &DocId,
    data: &[u8],
    cmds: &mut Vec<Command>,
) {
    if !sender_may_see(model, doc_id, channel_id) {
        debug!(channel = %channel_id, doc = %doc_id, "presence attachment from hidden peer dropped");
        return;
    }
    match decode_records(data) {
        Ok(records) => apply_records(model, doc_id, records, cmds),
        Err(e) => {
            warn!(channel = %channel_id, doc = %doc_id, error = %e, "malformed presence attachment dropped")
        }
    }
}

pub(crate) fn local_presence(
    model: &mut Model,
    doc_id: &DocId,
    namespace: String,
    value: Option<Vec<u8>>,
    now: Timestamp,
    cmds: &mut Vec<Command>,
) {
    if !model.documents.contains_key(doc_id) {
        debug!(doc = %doc_id, "presence for unknown document ignored");
        return;
    }
    let record = PresenceRecord {
        peer_id: model.identity.peer_id.clone(),
        namespace,
        value,
        timestamp: now,
    };
    let is_tombstone = record.value.is_none();
    let changed = model.presence.apply(doc_id, record.clone());
    if !changed && !is_tombstone {
        return;
    }
    if changed {
        cmds.push(Command::PresenceChanged {
            doc_id: doc_id.clone(),
        });
    }

    let mut records = model
        .presence
        .records_for_peer(doc_id, &model.identity.peer_id);
    if is_tombstone {
        records.push(record);
    }
    broadcast(model, doc_id, &records, LOCAL_HOPS, None, cmds);
}

pub(crate) fn presence_received(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: &DocId,
    hops_remaining: u8,
    data: Vec<u8>,
    cmds: &mut Vec<Command>,
) {
    if !model.documents.contains_key(doc_id) {
        trace!(channel = %channel_id, doc = %doc_id, "presence for unknown document dropped");
        return;
    }
    if !sender_may_see(model, doc_id, channel_id) {
        debug!(channel = %channel_id, doc = %doc_id, "presence from hidden peer dropped");
        return;
    }
    let records = match decode_records(&data) {
        Ok(records) => records,
        Err(e) => {
            warn!(channel = %channel_id, doc = %doc_id, error = %e, "malformed presence dropped");
            return;
        }
    };
    apply_records(model, doc_id, records, cmds);

    if hops_remaining == 0 {
        return;
    }
    for target in model.interested_channels(doc_id, false) {
        if target == channel_id {
            continue;
        }
        cmds.push(Command::send(
            target,
            ChannelMsg::Presence {
                doc_id: doc_id.clone(),
                hops_remaining: hops_remaining - 1,
                data: data.clone(),
            },
        ));
    }
}

pub(crate) fn heartbeat(model: &mut Model, now: Timestamp, cmds: &mut Vec<Command>) {
    let local = model.identity.peer_id.clone();
    model.presence.refresh_peer(&local, now);

    for doc_id in model.presence.doc_ids() {
        if !model.documents.contains_key(&doc_id) {
            continue;
        }
        let records = model.presence.records(&doc_id);
        broadcast(model, &doc_id, &records, 0, None, cmds);
    }
}

pub(crate) fn sweep(model: &mut Model, now: Timestamp, cmds: &mut Vec<Command>) {
    let expiry = model.presence_config.expiry_window();
    let local = model.identity.peer_id.clone();
    for doc_id in model.presence.sweep(now, expiry, &local) {
        debug!(doc = %doc_id, "expired presence removed");
        cmds.push(Command::PresenceChanged { doc_id });
    }
}

/// Drop everything a vanished peer published and tell our neighbours
pub(crate) fn peer_departed(
    model: &mut Model,
    peer_id: &PeerId,
    now: Timestamp,
    cmds: &mut Vec<Command>,
) {
    for (doc_id, tombstones) in model.presence.remove_peer(peer_id, now) {
        cmds.push(Command::PresenceChanged {
            doc_id: doc_id.clone(),
        });
        broadcast(model, &doc_id, &tombstones, LOCAL_HOPS, None, cmds);
    }
}
