//! Request bookkeeping: de-duplication, deadlines and backoff

use std::time::Duration;

use tracing::debug;

use super::command::Command;
use super::model::{LoadingState, Model, PendingRequest, RequestKey, RequestKind};
use super::wire::ChannelMsg;
use crate::config::SyncConfig;
use crate::core_doc::VersionVector;

/// Delay before re-send number `attempt` (1-based): base doubled per attempt, capped
pub fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config.backoff_base.saturating_mul(1u32 << exponent);
    delay.min(config.backoff_max)
}

/// Build the wire message for a pending request from current local state
pub(crate) fn request_message(
    model: &Model,
    key: &RequestKey,
    bidirectional: bool,
) -> Option<ChannelMsg> {
    match &key.kind {
        RequestKind::Directory => Some(ChannelMsg::DirectoryRequest),
        RequestKind::Sync(doc_id) => {
            let doc_state = model.documents.get(doc_id)?;
            Some(ChannelMsg::SyncRequest {
                doc_id: doc_id.clone(),
                requester_version: doc_state.doc.version(),
                bidirectional,
                presence: None,
            })
        }
    }
}

/// Send a request unless the same one is already in flight.
/// Returns whether a message was emitted.
pub(crate) fn issue_request(
    model: &mut Model,
    key: RequestKey,
    bidirectional: bool,
    cmds: &mut Vec<Command>,
) -> bool {
    if model.pending.contains_key(&key) {
        debug!(channel = %key.channel_id, kind = ?key.kind, "request already in flight");
        return false;
    }
    let Some(message) = request_message(model, &key, bidirectional) else {
        return false;
    };

    if let RequestKind::Sync(doc_id) = &key.kind {
        if let Some(state) = model.ensure_channel_doc_state(doc_id, key.channel_id) {
            state.loading = LoadingState::Loading;
        }
    }

    model.pending.insert(
        key.clone(),
        PendingRequest {
            attempt: 0,
            bidirectional,
            sent_version: sent_version(&message),
        },
    );
    cmds.push(Command::send(key.channel_id, message));
    cmds.push(Command::StartTimer {
        key,
        after: model.sync_config.request_timeout,
    });
    true
}

pub(crate) fn sent_version(message: &ChannelMsg) -> VersionVector {
    match message {
        ChannelMsg::SyncRequest {
            requester_version, ..
        } => requester_version.clone(),
        _ => VersionVector::new(),
    }
}

/// Clear a pending request after its answer arrived
pub(crate) fn resolve_request(
    model: &mut Model,
    key: &RequestKey,
    cmds: &mut Vec<Command>,
) -> Option<PendingRequest> {
    let pending = model.pending.remove(key)?;
    cmds.push(Command::CancelTimer { key: key.clone() });
    Some(pending)
}
