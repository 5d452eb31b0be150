//! Channel establishment handshake
//!
//! `unestablished --establish-request/response--> established`, at most once
//! per channel. Neither side announces documents here; the responder only
//! computes which documents it would reveal, the initiator then pulls.

use tracing::{debug, info, warn};

use crate::core_sync::command::Command;
use crate::core_sync::model::{ConnectionState, Model, PeerState, RequestKey};
use crate::core_sync::retry::issue_request;
use crate::core_sync::types::{ChannelId, PeerIdentity};
use crate::core_sync::wire::ChannelMsg;

enum Outcome {
    New,
    Duplicate,
    Conflict,
}

fn record_peer(model: &mut Model, channel_id: ChannelId, identity: PeerIdentity) -> Outcome {
    let Some(channel) = model.channels.get_mut(&channel_id) else {
        return Outcome::Conflict;
    };

    if let Some(existing) = channel.identity() {
        if existing.peer_id == identity.peer_id {
            return Outcome::Duplicate;
        }
        warn!(
            channel = %channel_id,
            existing = %existing.peer_id,
            claimed = %identity.peer_id,
            "channel already established with another peer"
        );
        return Outcome::Conflict;
    }

    info!(channel = %channel_id, peer = %identity.peer_id, name = %identity.name, "channel established");
    channel.peer = PeerState::Established { identity };
    if channel.connection_state == ConnectionState::Connecting {
        channel.connection_state = ConnectionState::Connected;
    }

    for doc_id in model.doc_ids() {
        model.ensure_channel_doc_state(&doc_id, channel_id);
    }
    Outcome::New
}

pub(crate) fn establish_request(
    model: &mut Model,
    channel_id: ChannelId,
    identity: PeerIdentity,
    cmds: &mut Vec<Command>,
) {
    match record_peer(model, channel_id, identity) {
        Outcome::New | Outcome::Duplicate => cmds.push(Command::send(
            channel_id,
            ChannelMsg::EstablishResponse {
                identity: model.identity.clone(),
            },
        )),
        Outcome::Conflict => {}
    }
}

pub(crate) fn establish_response(
    model: &mut Model,
    channel_id: ChannelId,
    identity: PeerIdentity,
    cmds: &mut Vec<Command>,
) {
    match record_peer(model, channel_id, identity) {
        Outcome::New => {}
        Outcome::Duplicate => {
            debug!(channel = %channel_id, "duplicate establish-response ignored");
            return;
        }
        Outcome::Conflict => return,
    }

    issue_request(model, RequestKey::directory(channel_id), false, cmds);

    for doc_id in model.doc_ids() {
        let revealable = model
            .channel_doc_state(&doc_id, channel_id)
            .map_or(false, |state| state.can_reveal);
        if revealable {
            issue_request(model, RequestKey::sync(channel_id, doc_id), true, cmds);
        }
    }
}
