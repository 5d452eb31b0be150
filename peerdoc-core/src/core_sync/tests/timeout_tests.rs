/*
    Timeout tests - retries with backoff, giving up, cancellation
*/

use std::time::Duration;

use super::*;
use crate::test_utils::fast_sync_config;

fn pending_sync() -> (Model, RequestKey) {
    let model = TestModelBuilder::new("me")
        .with_sync_config(fast_sync_config())
        .build()
        .0;
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, cmds) = update(model, Message::DocEnsure { doc_id: doc("doc1") });
    let key = RequestKey::sync(ChannelId(1), doc("doc1"));
    assert!(cmds.iter().any(|cmd| matches!(
        cmd,
        Command::StartTimer { key: k, after } if *k == key && *after == Duration::from_millis(100)
    )));
    (model, key)
}

fn timer_after(cmds: &[Command]) -> Option<Duration> {
    cmds.iter().find_map(|cmd| match cmd {
        Command::StartTimer { after, .. } => Some(*after),
        _ => None,
    })
}

#[test]
fn test_sync_request_retries_with_backoff_then_gives_up() {
    let (model, key) = pending_sync();

    let (model, cmds) = update(model, Message::Timeout { key: key.clone() });
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&sync_request("doc1", VersionVector::new(), true)]
    );
    assert_eq!(timer_after(&cmds), Some(Duration::from_millis(150)));

    let (model, cmds) = update(model, Message::Timeout { key: key.clone() });
    assert_eq!(sends(&cmds), 1);
    assert_eq!(timer_after(&cmds), Some(Duration::from_millis(200)));

    let (model, cmds) = update(model, Message::Timeout { key: key.clone() });
    assert_eq!(sends(&cmds), 0);
    assert!(matches!(cmds[..], [Command::DocReady { .. }]));
    assert_eq!(
        model.channel_doc_state(&doc("doc1"), ChannelId(1)).unwrap().loading,
        LoadingState::NotFound
    );
    assert!(model.pending.is_empty());

    // Late timer and late answer change nothing visible
    let (model, cmds) = update(model, Message::Timeout { key });
    assert!(cmds.is_empty());
    let (_, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::SyncResponse {
            doc_id: doc("doc1"),
            transmission: Transmission::UpToDate {
                version: VersionVector::new(),
            },
            presence: None,
        },
    );
    assert!(cmds.is_empty());
}

#[test]
fn test_directory_request_gives_up_quietly() {
    let model = TestModelBuilder::new("me")
        .with_sync_config(fast_sync_config())
        .build()
        .0;
    let (mut model, _) = update_all(
        model,
        vec![
            Message::ChannelAdded {
                channel_id: ChannelId(1),
                kind: ChannelKind::Network,
            },
            Message::ChannelReceived {
                channel_id: ChannelId(1),
                message: ChannelMsg::EstablishResponse {
                    identity: peer("p1"),
                },
            },
        ],
    );
    let key = RequestKey::directory(ChannelId(1));

    for _ in 0..2 {
        let (next, cmds) = update(model, Message::Timeout { key: key.clone() });
        assert_eq!(
            sent_to(&cmds, ChannelId(1)),
            vec![&ChannelMsg::DirectoryRequest]
        );
        model = next;
    }
    let (model, cmds) = update(model, Message::Timeout { key });
    assert!(cmds.is_empty());
    assert!(model.pending.is_empty());
}

#[test]
fn test_channel_removal_cancels_requests_and_unblocks_waiters() {
    let (model, key) = pending_sync();
    let (model, cmds) = update(
        model,
        Message::ChannelRemoved {
            channel_id: ChannelId(1),
            now: Timestamp::from_millis(1),
        },
    );
    assert!(matches!(
        &cmds[..],
        [Command::CancelTimer { key: cancelled }, Command::DocReady { .. }] if *cancelled == key
    ));
    assert!(model.pending.is_empty());
    assert!(model.channels.is_empty());
    assert!(model.channel_doc_state(&doc("doc1"), ChannelId(1)).is_none());

    // A timer that was already in flight is harmless
    let (_, cmds) = update(model, Message::Timeout { key });
    assert!(cmds.is_empty());
}

#[test]
fn test_duplicate_request_is_not_reissued() {
    let (model, _) = pending_sync();
    let (_, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::DirectoryResponse {
            doc_ids: vec![doc("doc1")],
        },
    );
    assert_eq!(sends(&cmds), 0);
}
