/*
    update.rs - The synchronizer entry point

    update(model, message) -> (model, commands)

    Pure: no I/O, no clocks, no panics. Every branch hands back a valid model.
    Unexpected or late input (unknown channel, duplicate response, message on
    an unestablished channel) is logged and ignored.
*/

use tracing::{debug, trace, warn};

use super::command::Command;
use super::handlers::{channel, delete, directory, establish, presence, sync, timeout};
use super::message::Message;
use super::model::Model;
use super::types::ChannelId;
use super::wire::ChannelMsg;

pub fn update(model: Model, message: Message) -> (Model, Vec<Command>) {
    let mut model = model;
    let mut cmds = Vec::new();
    trace!(message = message.kind(), "update");

    match message {
        Message::ChannelAdded { channel_id, kind } => {
            channel::channel_added(&mut model, channel_id, kind)
        }
        Message::EstablishChannel { channel_id } => {
            channel::establish_channel(&mut model, channel_id, &mut cmds)
        }
        Message::ChannelFailed { channel_id, reason } => {
            channel::channel_failed(&mut model, channel_id, &reason)
        }
        Message::ChannelRemoved { channel_id, now } => {
            channel::channel_removed(&mut model, channel_id, now, &mut cmds)
        }
        Message::SendRejected {
            channel_id,
            doc_id,
            reason,
        } => sync::send_rejected(&mut model, channel_id, doc_id, reason, &mut cmds),
        Message::ChannelReceived {
            channel_id,
            message,
        } => receive(&mut model, channel_id, message, &mut cmds),
        Message::DocEnsure { doc_id } => sync::doc_ensure(&mut model, &doc_id, &mut cmds),
        Message::LocalDocChange { doc_id } => {
            sync::local_doc_change(&mut model, &doc_id, &mut cmds)
        }
        Message::DocDelete { doc_id } => delete::doc_delete(&mut model, &doc_id, &mut cmds),
        Message::LocalPresence {
            doc_id,
            namespace,
            value,
            now,
        } => presence::local_presence(&mut model, &doc_id, namespace, value, now, &mut cmds),
        Message::HeartbeatTick { now } => presence::heartbeat(&mut model, now, &mut cmds),
        Message::PresenceSweep { now } => presence::sweep(&mut model, now, &mut cmds),
        Message::Timeout { key } => timeout::request_timeout(&mut model, key, &mut cmds),
        Message::ImportCompleted {
            channel_id,
            doc_id,
            peer_version,
            result,
        } => sync::import_completed(
            &mut model,
            channel_id,
            &doc_id,
            peer_version,
            result,
            &mut cmds,
        ),
    }

    (model, cmds)
}

/// Apply a sequence of messages, collecting every command
pub fn update_all(
    model: Model,
    messages: impl IntoIterator<Item = Message>,
) -> (Model, Vec<Command>) {
    messages
        .into_iter()
        .fold((model, Vec::new()), |(model, mut all), message| {
            let (model, cmds) = update(model, message);
            all.extend(cmds);
            (model, all)
        })
}

fn receive(model: &mut Model, channel_id: ChannelId, message: ChannelMsg, cmds: &mut Vec<Command>) {
    let Some(channel) = model.channels.get(&channel_id) else {
        debug!(channel = %channel_id, kind = message.kind(), "message for unknown channel dropped");
        return;
    };

    if channel.identity().is_none() && !message.is_establishment() {
        warn!(
            channel = %channel_id,
            kind = message.kind(),
            "message on unestablished channel ignored"
        );
        return;
    }

    match message {
        ChannelMsg::Batch { messages } => {
            for inner in messages {
                receive(model, channel_id, inner, cmds);
            }
        }
        ChannelMsg::EstablishRequest { identity } => {
            establish::establish_request(model, channel_id, identity, cmds)
        }
        ChannelMsg::EstablishResponse { identity } => {
            establish::establish_response(model, channel_id, identity, cmds)
        }
        ChannelMsg::DirectoryRequest => directory::directory_request(model, channel_id, cmds),
        ChannelMsg::DirectoryResponse { doc_ids } => {
            directory::directory_response(model, channel_id, doc_ids, cmds)
        }
        ChannelMsg::SyncRequest {
            doc_id,
            requester_version,
            bidirectional,
            presence: attached,
        } => sync::sync_request(
            model,
            channel_id,
            doc_id,
            requester_version,
            bidirectional,
            attached,
            cmds,
        ),
        ChannelMsg::SyncResponse {
            doc_id,
            transmission,
            presence: attached,
        } => sync::sync_response(model, channel_id, doc_id, transmission, attached, cmds),
        ChannelMsg::Presence {
            doc_id,
            hops_remaining,
            data,
        } => presence::presence_received(model, channel_id, &doc_id, hops_remaining, data, cmds),
        ChannelMsg::DeleteRequest { doc_id } => {
            delete::delete_request(model, channel_id, &doc_id, cmds)
        }
        ChannelMsg::DeleteResponse { doc_id, ok } => {
            delete::delete_response(model, channel_id, &doc_id, ok)
        }
    }
}
