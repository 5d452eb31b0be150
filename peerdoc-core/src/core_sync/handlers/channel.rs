//! Channel lifecycle: registration, handshake start, failure, removal

use tracing::{debug, info, warn};

use super::presence;
use super::settle;
use crate::core_sync::command::Command;
use crate::core_sync::model::{Channel, ConnectionState, LoadingState, Model, RequestKey};
use crate::core_sync::types::{ChannelId, ChannelKind, Timestamp};
use crate::core_sync::wire::ChannelMsg;

pub(crate) fn channel_added(model: &mut Model, channel_id: ChannelId, kind: ChannelKind) {
    if model.channels.contains_key(&channel_id) {
        warn!(channel = %channel_id, "channel id already registered, ignoring");
        return;
    }
    debug!(channel = %channel_id, ?kind, "channel added");
    model
        .channels
        .insert(channel_id, Channel::new(channel_id, kind));
}

pub(crate) fn establish_channel(model: &mut Model, channel_id: ChannelId, cmds: &mut Vec<Command>) {
    let Some(channel) = model.channels.get(&channel_id) else {
        debug!(channel = %channel_id, "establish for unknown channel dropped");
        return;
    };
    if channel.identity().is_some() {
        debug!(channel = %channel_id, "channel already established");
        return;
    }
    cmds.push(Command::send(
        channel_id,
        ChannelMsg::EstablishRequest {
            identity: model.identity.clone(),
        },
    ));
}

pub(crate) fn channel_failed(model: &mut Model, channel_id: ChannelId, reason: &str) {
    if let Some(channel) = model.channels.get_mut(&channel_id) {
        warn!(channel = %channel_id, %reason, "channel failed");
        channel.connection_state = ConnectionState::Error;
    }
}

pub(crate) fn channel_removed(
    model: &mut Model,
    channel_id: ChannelId,
    now: Timestamp,
    cmds: &mut Vec<Command>,
) {
    let Some(mut channel) = model.channels.remove(&channel_id) else {
        debug!(channel = %channel_id, "removal of unknown channel ignored");
        return;
    };
    channel.connection_state = ConnectionState::Disconnected;
    info!(channel = %channel_id, peer = ?channel.identity().map(|i| &i.name), "channel removed");

    let mut stale: Vec<RequestKey> = model
        .pending
        .keys()
        .filter(|key| key.channel_id == channel_id)
        .cloned()
        .collect();
    stale.sort();
    for key in stale {
        model.pending.remove(&key);
        cmds.push(Command::CancelTimer { key });
    }

    let mut unblocked = Vec::new();
    for doc_id in model.doc_ids() {
        let Some(doc_state) = model.documents.get_mut(&doc_id) else {
            continue;
        };
        if let Some(state) = doc_state.channel_state.remove(&channel_id) {
            if state.loading == LoadingState::Loading {
                unblocked.push(doc_id);
            }
        }
    }
    for doc_id in unblocked {
        settle(model, &doc_id, cmds);
    }

    if let Some(identity) = channel.identity() {
        let still_connected = model
            .channels
            .values()
            .any(|other| other.identity().map(|i| &i.peer_id) == Some(&identity.peer_id));
        if !still_connected {
            presence::peer_departed(model, &identity.peer_id, now, cmds);
        }
    }
}
