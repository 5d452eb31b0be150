//! Document deletion
//!
//! A local delete asks every channel holding the document to drop it too.
//! Responses are informational; a refusal does not resurrect the local copy.
//! Unknown and refused documents both answer `ok: false`.

use tracing::{debug, info, warn};

use crate::core_sync::command::Command;
use crate::core_sync::model::{Model, RequestKey, RequestKind};
use crate::core_sync::types::{ChannelId, DocId};
use crate::core_sync::wire::ChannelMsg;

/// Remove a document with its presence and outstanding requests
fn forget_document(model: &mut Model, doc_id: &DocId, cmds: &mut Vec<Command>) {
    model.documents.remove(doc_id);
    model.presence.remove_doc(doc_id);

    let mut stale: Vec<RequestKey> = model
        .pending
        .keys()
        .filter(|key| matches!(&key.kind, RequestKind::Sync(id) if id == doc_id))
        .cloned()
        .collect();
    stale.sort();
    for key in stale {
        model.pending.remove(&key);
        cmds.push(Command::CancelTimer { key });
    }

    cmds.push(Command::DocRemoved {
        doc_id: doc_id.clone(),
    });
}

pub(crate) fn doc_delete(model: &mut Model, doc_id: &DocId, cmds: &mut Vec<Command>) {
    if !model.documents.contains_key(doc_id) {
        debug!(doc = %doc_id, "delete of unknown document ignored");
        return;
    }
    for channel_id in model.interested_channels(doc_id, true) {
        cmds.push(Command::send(
            channel_id,
            ChannelMsg::DeleteRequest {
                doc_id: doc_id.clone(),
            },
        ));
    }
    info!(doc = %doc_id, "document deleted");
    forget_document(model, doc_id, cmds);
}

pub(crate) fn delete_request(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: &DocId,
    cmds: &mut Vec<Command>,
) {
    let allowed = match (
        model.documents.get(doc_id),
        model.channels.get(&channel_id).and_then(|c| c.peer_context()),
    ) {
        (Some(doc_state), Some(peer)) => Some(model.rules.can_delete(&doc_state.context(), &peer)),
        _ => None,
    };

    let ok = match allowed {
        Some(true) => {
            info!(channel = %channel_id, doc = %doc_id, "document deleted by peer");
            forget_document(model, doc_id, cmds);
            true
        }
        Some(false) => {
            warn!(channel = %channel_id, doc = %doc_id, "delete rejected by rules");
            false
        }
        None => {
            debug!(channel = %channel_id, doc = %doc_id, "delete of unknown document");
            false
        }
    };

    cmds.push(Command::send(
        channel_id,
        ChannelMsg::DeleteResponse {
            doc_id: doc_id.clone(),
            ok,
        },
    ));
}

pub(crate) fn delete_response(model: &Model, channel_id: ChannelId, doc_id: &DocId, ok: bool) {
    let peer = model
        .channels
        .get(&channel_id)
        .and_then(|c| c.identity())
        .map(|identity| identity.peer_id.clone());
    if ok {
        debug!(channel = %channel_id, doc = %doc_id, ?peer, "peer deleted document");
    } else {
        warn!(channel = %channel_id, doc = %doc_id, ?peer, "peer did not delete document");
    }
}
