//! Request deadlines
//!
//! A timed-out request is re-sent with exponential backoff added to the next
//! deadline. Once retries run out a sync request counts as not found, so
//! waiters resolve instead of hanging.

use tracing::{debug, warn};

use super::settle;
use crate::core_sync::command::Command;
use crate::core_sync::model::{LoadingState, Model, RequestKey, RequestKind};
use crate::core_sync::retry::{backoff_delay, request_message, sent_version};

pub(crate) fn request_timeout(model: &mut Model, key: RequestKey, cmds: &mut Vec<Command>) {
    let Some(pending) = model.pending.get(&key).cloned() else {
        debug!(channel = %key.channel_id, kind = ?key.kind, "late timeout ignored");
        return;
    };
    if !model.channels.contains_key(&key.channel_id) {
        model.pending.remove(&key);
        return;
    }

    if pending.attempt < model.sync_config.max_retries {
        let attempt = pending.attempt + 1;
        let Some(message) = request_message(model, &key, pending.bidirectional) else {
            model.pending.remove(&key);
            return;
        };
        debug!(channel = %key.channel_id, kind = ?key.kind, attempt, "request timed out, retrying");
        if let Some(entry) = model.pending.get_mut(&key) {
            entry.attempt = attempt;
            entry.sent_version = sent_version(&message);
        }
        let after = model.sync_config.request_timeout + backoff_delay(&model.sync_config, attempt);
        cmds.push(Command::send(key.channel_id, message));
        cmds.push(Command::StartTimer { key, after });
        return;
    }

    model.pending.remove(&key);
    match &key.kind {
        RequestKind::Sync(doc_id) => {
            warn!(channel = %key.channel_id, doc = %doc_id, "sync request gave up after retries");
            if let Some(state) = model
                .documents
                .get_mut(doc_id)
                .and_then(|doc_state| doc_state.channel_state.get_mut(&key.channel_id))
            {
                state.loading = LoadingState::NotFound;
            }
            settle(model, doc_id, cmds);
        }
        RequestKind::Directory => {
            warn!(channel = %key.channel_id, "directory request gave up after retries");
        }
    }
}
