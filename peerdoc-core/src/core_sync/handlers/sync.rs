//! Document sync protocol
//!
//! sync-request carries the requester's version; the responder answers with
//! a snapshot, an update, up-to-date or unavailable. A bidirectional request
//! from a peer that has something we lack earns one reciprocal request with
//! `bidirectional = false`, which never earns another one.
//!
//! Local edits and freshly imported data are pushed to every channel that
//! holds the document and is known to be behind.

use tracing::{debug, warn};

use super::presence::apply_attached;
use super::{create_document, settle, subscribe_once};
use crate::core_doc::{DocHandle, DocResult, ExportMode, VersionOrder, VersionVector};
use crate::core_sync::command::Command;
use crate::core_sync::model::{LoadingState, Model, RequestKey};
use crate::core_sync::presence::encode_records;
use crate::core_sync::retry::{issue_request, resolve_request};
use crate::core_sync::types::{ChannelId, DocId};
use crate::core_sync::wire::{ChannelMsg, Transmission};

/// Decide what the holder of `requester` needs from us
pub(crate) fn build_transmission(
    doc: &DocHandle,
    local: &VersionVector,
    requester: &VersionVector,
) -> DocResult<Transmission> {
    if requester.is_empty() && !local.is_empty() {
        return Ok(Transmission::Snapshot {
            data: doc.export(&ExportMode::Snapshot)?,
            version: local.clone(),
        });
    }
    match local.compare(requester) {
        VersionOrder::Equal | VersionOrder::Less => Ok(Transmission::UpToDate {
            version: local.clone(),
        }),
        VersionOrder::Greater | VersionOrder::Concurrent => Ok(Transmission::Update {
            data: doc.export(&ExportMode::Update {
                from: requester.clone(),
            })?,
            version: local.clone(),
        }),
    }
}

/// Full presence of a document, encoded for attachment; `None` when empty
fn presence_attachment(model: &Model, doc_id: &DocId) -> Option<Vec<u8>> {
    let records = model.presence.records(doc_id);
    if records.is_empty() {
        return None;
    }
    match encode_records(&records) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(doc = %doc_id, error = %e, "failed to encode presence attachment");
            None
        }
    }
}

fn unavailable(channel_id: ChannelId, doc_id: DocId, cmds: &mut Vec<Command>) {
    cmds.push(Command::send(
        channel_id,
        ChannelMsg::SyncResponse {
            doc_id,
            transmission: Transmission::Unavailable,
            presence: None,
        },
    ));
}

pub(crate) fn sync_request(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: DocId,
    requester_version: VersionVector,
    bidirectional: bool,
    attached: Option<Vec<u8>>,
    cmds: &mut Vec<Command>,
) {
    if !model.documents.contains_key(&doc_id) {
        let allowed = model
            .channels
            .get(&channel_id)
            .and_then(|channel| channel.peer_context())
            .map_or(false, |peer| model.rules.can_create(&doc_id, &peer));
        if !allowed {
            debug!(channel = %channel_id, doc = %doc_id, "create rejected, answering unavailable");
            unavailable(channel_id, doc_id, cmds);
            return;
        }
        create_document(model, &doc_id);
    }

    let can_reveal = match model.ensure_channel_doc_state(&doc_id, channel_id) {
        Some(state) => {
            // Requesting implies interest
            state.mark_has_doc();
            state.can_reveal
        }
        None => false,
    };
    if !can_reveal {
        debug!(channel = %channel_id, doc = %doc_id, "reveal rejected, answering unavailable");
        unavailable(channel_id, doc_id, cmds);
        return;
    }
    if let Some(data) = attached {
        apply_attached(model, channel_id, &doc_id, &data, cmds);
    }

    let Some(doc) = model.documents.get(&doc_id).map(|state| state.doc.clone()) else {
        return;
    };
    let local = doc.version();
    let transmission = match build_transmission(&doc, &local, &requester_version) {
        Ok(transmission) => transmission,
        Err(e) => {
            warn!(doc = %doc_id, error = %e, "export failed, answering unavailable");
            Transmission::Unavailable
        }
    };
    debug!(
        channel = %channel_id,
        doc = %doc_id,
        transmission = transmission.kind(),
        "answering sync request"
    );

    if transmission != Transmission::Unavailable {
        if let Some(state) = model.ensure_channel_doc_state(&doc_id, channel_id) {
            state.last_known_version.merge(&requester_version);
            state.last_known_version.merge(&local);
        }
    }

    cmds.push(Command::send(
        channel_id,
        ChannelMsg::SyncResponse {
            doc_id: doc_id.clone(),
            transmission,
            presence: presence_attachment(model, &doc_id),
        },
    ));

    let requester_has_more = matches!(
        local.compare(&requester_version),
        VersionOrder::Less | VersionOrder::Concurrent
    );
    if bidirectional && requester_has_more {
        debug!(channel = %channel_id, doc = %doc_id, "requester is ahead, sending reciprocal request");
        issue_request(model, RequestKey::sync(channel_id, doc_id), false, cmds);
    }
}

pub(crate) fn sync_response(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: DocId,
    transmission: Transmission,
    attached: Option<Vec<u8>>,
    cmds: &mut Vec<Command>,
) {
    let resolved = resolve_request(model, &RequestKey::sync(channel_id, doc_id.clone()), cmds);

    if !model.documents.contains_key(&doc_id) {
        debug!(channel = %channel_id, doc = %doc_id, "sync response for unknown document dropped");
        return;
    }
    if let Some(data) = attached {
        apply_attached(model, channel_id, &doc_id, &data, cmds);
    }

    let update_allowed = match (
        model.documents.get(&doc_id),
        model.channels.get(&channel_id).and_then(|c| c.peer_context()),
    ) {
        (Some(doc_state), Some(peer)) => model.rules.can_update(&doc_state.context(), &peer),
        _ => false,
    };
    let doc = model.documents.get(&doc_id).map(|state| state.doc.clone());
    let local = doc.as_ref().map(|doc| doc.version()).unwrap_or_default();

    let Some(state) = model.ensure_channel_doc_state(&doc_id, channel_id) else {
        return;
    };
    let was_loading = state.loading == LoadingState::Loading;
    let mut catch_up = false;

    match transmission {
        Transmission::Unavailable => {
            state.mark_no_doc();
            state.loading = LoadingState::NotFound;
        }
        Transmission::UpToDate { version } => {
            state.mark_has_doc();
            state.last_known_version.merge(&version);
            state.loading = LoadingState::Found { version };
            // A peer behind a bidirectional request asks back on its own; only
            // edits made after the request went out, or a one-way request,
            // leave it short
            catch_up = resolved.map_or(false, |pending| {
                !pending.bidirectional || !pending.sent_version.includes(&local)
            });
        }
        Transmission::Snapshot { data, version } | Transmission::Update { data, version } => {
            state.mark_has_doc();
            state.last_known_version.merge(&version);
            match doc {
                Some(doc) if update_allowed => {
                    cmds.push(Command::Import {
                        channel_id,
                        doc_id: doc_id.clone(),
                        doc,
                        data,
                        peer_version: version,
                    });
                    // Loading resolves when the import result comes back
                    return;
                }
                _ => {
                    warn!(channel = %channel_id, doc = %doc_id, "update rejected by rules, dropped");
                    state.loading = LoadingState::Found { version };
                }
            }
        }
    }

    if catch_up {
        push_to_channel(model, &doc_id, channel_id, cmds);
    }
    if was_loading {
        settle(model, &doc_id, cmds);
    }
}

pub(crate) fn import_completed(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: &DocId,
    peer_version: VersionVector,
    result: Result<VersionVector, String>,
    cmds: &mut Vec<Command>,
) {
    let Some(doc_state) = model.documents.get_mut(doc_id) else {
        debug!(doc = %doc_id, "import result for removed document dropped");
        return;
    };
    let channel_state = doc_state.channel_state.get_mut(&channel_id);
    let was_loading = channel_state
        .as_ref()
        .map_or(false, |state| state.loading == LoadingState::Loading);

    match result {
        Ok(version) => {
            debug!(channel = %channel_id, doc = %doc_id, %version, "import applied");
            if let Some(state) = channel_state {
                state.last_known_version.merge(&peer_version);
                state.loading = LoadingState::Found {
                    version: peer_version,
                };
            }
            subscribe_once(model, doc_id, cmds);
            push_updates(model, doc_id, Some(channel_id), cmds);
        }
        Err(reason) => {
            warn!(channel = %channel_id, doc = %doc_id, %reason, "import failed");
            if let Some(state) = channel_state {
                state.loading = LoadingState::Failed { reason };
            }
        }
    }

    if was_loading {
        settle(model, doc_id, cmds);
    }
}

/// An outbound message about `doc_id` was refused before reaching the wire.
/// Only that pairing fails; other documents keep using the channel.
pub(crate) fn send_rejected(
    model: &mut Model,
    channel_id: ChannelId,
    doc_id: Option<DocId>,
    reason: String,
    cmds: &mut Vec<Command>,
) {
    let Some(doc_id) = doc_id else {
        warn!(channel = %channel_id, %reason, "rejected send outside any document dropped");
        return;
    };
    let Some(state) = model
        .documents
        .get_mut(&doc_id)
        .and_then(|doc_state| doc_state.channel_state.get_mut(&channel_id))
    else {
        debug!(channel = %channel_id, doc = %doc_id, "rejected send for unknown pairing ignored");
        return;
    };
    warn!(channel = %channel_id, doc = %doc_id, %reason, "send rejected, pairing failed");
    let was_loading = state.loading == LoadingState::Loading;
    // Nothing reached the peer
    state.last_known_version = VersionVector::new();
    state.loading = LoadingState::Failed { reason };
    if was_loading {
        settle(model, &doc_id, cmds);
    }
}

/// Send every interested channel what it is missing, except `exclude`
pub(crate) fn push_updates(
    model: &mut Model,
    doc_id: &DocId,
    exclude: Option<ChannelId>,
    cmds: &mut Vec<Command>,
) {
    for channel_id in model.interested_channels(doc_id, true) {
        if Some(channel_id) != exclude {
            push_to_channel(model, doc_id, channel_id, cmds);
        }
    }
}

/// Send one channel whatever our replica has beyond its last known version
fn push_to_channel(model: &mut Model, doc_id: &DocId, channel_id: ChannelId, cmds: &mut Vec<Command>) {
    let Some(doc) = model.documents.get(doc_id).map(|state| state.doc.clone()) else {
        return;
    };
    let local = doc.version();
    if local.is_empty() {
        return;
    }
    let Some(state) = model
        .documents
        .get_mut(doc_id)
        .and_then(|doc_state| doc_state.channel_state.get_mut(&channel_id))
    else {
        return;
    };
    if !state.can_reveal
        || matches!(state.loading, LoadingState::Failed { .. })
        || state.last_known_version.includes(&local)
    {
        return;
    }

    let known = state.last_known_version.clone();
    let exported = if known.is_empty() {
        doc.export(&ExportMode::Snapshot).map(|data| Transmission::Snapshot {
            data,
            version: local.clone(),
        })
    } else {
        doc.export(&ExportMode::Update { from: known })
            .map(|data| Transmission::Update {
                data,
                version: local.clone(),
            })
    };
    let transmission = match exported {
        Ok(transmission) => transmission,
        Err(e) => {
            warn!(channel = %channel_id, doc = %doc_id, error = %e, "export for push failed");
            return;
        }
    };

    state.last_known_version.merge(&local);
    debug!(
        channel = %channel_id,
        doc = %doc_id,
        transmission = transmission.kind(),
        "pushing local changes"
    );
    cmds.push(Command::send(
        channel_id,
        ChannelMsg::SyncResponse {
            doc_id: doc_id.clone(),
            transmission,
            presence: None,
        },
    ));
}

pub(crate) fn local_doc_change(model: &mut Model, doc_id: &DocId, cmds: &mut Vec<Command>) {
    if !model.documents.contains_key(doc_id) {
        debug!(doc = %doc_id, "change notification for unknown document ignored");
        return;
    }
    push_updates(model, doc_id, None, cmds);
}

pub(crate) fn doc_ensure(model: &mut Model, doc_id: &DocId, cmds: &mut Vec<Command>) {
    let created = create_document(model, doc_id);
    subscribe_once(model, doc_id, cmds);

    if created {
        for channel_id in model.usable_channel_ids() {
            let revealable = model
                .channel_doc_state(doc_id, channel_id)
                .map_or(false, |state| state.can_reveal);
            if revealable {
                issue_request(model, RequestKey::sync(channel_id, doc_id.clone()), true, cmds);
            }
        }
    }

    // Resolve waiters right away when nothing is outstanding
    settle(model, doc_id, cmds);
}
