//! Protocol handlers, one module per concern. Each takes the model by
//! `&mut` and appends to the command list; none of them can fail.

pub(crate) mod channel;
pub(crate) mod delete;
pub(crate) mod directory;
pub(crate) mod establish;
pub(crate) mod presence;
pub(crate) mod sync;
pub(crate) mod timeout;

use tracing::debug;

use super::command::Command;
use super::model::{DocumentState, Model};
use super::types::DocId;

/// Create an empty local replica and pair it with every established channel.
/// Returns false when the document already existed.
pub(crate) fn create_document(model: &mut Model, doc_id: &DocId) -> bool {
    if model.documents.contains_key(doc_id) {
        return false;
    }
    let doc = model.factory.create(doc_id, &model.identity.peer_id);
    model
        .documents
        .insert(doc_id.clone(), DocumentState::new(doc_id.clone(), doc));
    for channel_id in model.usable_channel_ids() {
        model.ensure_channel_doc_state(doc_id, channel_id);
    }
    debug!(doc = %doc_id, "document created");
    true
}

/// Emit `DocReady` once no channel is loading the document
pub(crate) fn settle(model: &Model, doc_id: &DocId, cmds: &mut Vec<Command>) {
    if let Some(state) = model.documents.get(doc_id) {
        if !state.is_loading() {
            cmds.push(Command::DocReady {
                doc_id: doc_id.clone(),
            });
        }
    }
}

/// Subscribe to local edits the first time a document becomes live here
pub(crate) fn subscribe_once(model: &mut Model, doc_id: &DocId, cmds: &mut Vec<Command>) {
    if let Some(state) = model.documents.get_mut(doc_id) {
        if !state.subscribed {
            state.subscribed = true;
            cmds.push(Command::Subscribe {
                doc_id: doc_id.clone(),
                doc: state.doc.clone(),
            });
        }
    }
}
