//! Pull-based discovery
//!
//! A peer asks which documents exist; we answer only with the ones our
//! reveal rule lets it see. Learned ids become placeholders and are synced.

use tracing::debug;

use super::create_document;
use crate::core_sync::command::Command;
use crate::core_sync::model::{Model, RequestKey};
use crate::core_sync::retry::{issue_request, resolve_request};
use crate::core_sync::types::{ChannelId, DocId};
use crate::core_sync::wire::ChannelMsg;

pub(crate) fn directory_request(model: &mut Model, channel_id: ChannelId, cmds: &mut Vec<Command>) {
    let mut doc_ids = Vec::new();
    for doc_id in model.doc_ids() {
        let revealable = model
            .ensure_channel_doc_state(&doc_id, channel_id)
            .map_or(false, |state| state.can_reveal);
        if revealable {
            doc_ids.push(doc_id);
        }
    }
    debug!(channel = %channel_id, count = doc_ids.len(), "answering directory request");
    cmds.push(Command::send(
        channel_id,
        ChannelMsg::DirectoryResponse { doc_ids },
    ));
}

pub(crate) fn directory_response(
    model: &mut Model,
    channel_id: ChannelId,
    doc_ids: Vec<DocId>,
    cmds: &mut Vec<Command>,
) {
    resolve_request(model, &RequestKey::directory(channel_id), cmds);

    for doc_id in doc_ids {
        if create_document(model, &doc_id) {
            debug!(channel = %channel_id, doc = %doc_id, "learned document from directory");
        }
        if let Some(state) = model.ensure_channel_doc_state(&doc_id, channel_id) {
            state.mark_has_doc();
        }
        issue_request(model, RequestKey::sync(channel_id, doc_id), true, cmds);
    }
}
