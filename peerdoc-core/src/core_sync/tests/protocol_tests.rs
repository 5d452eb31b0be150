/*
    Protocol tests - establishment, discovery, push, rules and deletion
*/

use serde_json::json;

use super::*;
use crate::core_doc::Document;

fn initiator() -> Model {
    TestModelBuilder::new("me").build().0
}

#[test]
fn test_initiator_handshake() {
    let model = initiator();
    let me = model.identity.clone();
    let (model, cmds) = update_all(
        model,
        vec![
            Message::ChannelAdded {
                channel_id: ChannelId(1),
                kind: ChannelKind::Network,
            },
            Message::EstablishChannel {
                channel_id: ChannelId(1),
            },
        ],
    );
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&ChannelMsg::EstablishRequest { identity: me }]
    );
    assert!(!model.channels[&ChannelId(1)].is_usable());

    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::EstablishResponse {
            identity: peer("p1"),
        },
    );
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&ChannelMsg::DirectoryRequest]
    );
    assert!(cmds.iter().any(|cmd| matches!(
        cmd,
        Command::StartTimer { key, .. } if *key == RequestKey::directory(ChannelId(1))
    )));
    assert!(model.channels[&ChannelId(1)].is_usable());

    // Handshake happens once
    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::EstablishResponse {
            identity: peer("p1"),
        },
    );
    assert!(cmds.is_empty());
    let (_, cmds) = update(
        model,
        Message::EstablishChannel {
            channel_id: ChannelId(1),
        },
    );
    assert!(cmds.is_empty());
}

#[test]
fn test_initiator_syncs_existing_documents() {
    let (model, _) = model_with_doc(TestModelBuilder::new("me"), "doc1", &[("k", json!(1))]);
    let (_, cmds) = update_all(
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

    let expected_version: VersionVector = [("me", 1u64)].into_iter().collect();
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![
            &ChannelMsg::DirectoryRequest,
            &sync_request("doc1", expected_version, true),
        ]
    );
}

#[test]
fn test_responder_answers_duplicates_and_rejects_impostor() {
    let model = connect_peer(initiator(), ChannelId(1), ChannelKind::Network, peer("p1"));

    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::EstablishRequest {
            identity: peer("p1"),
        },
    );
    assert_eq!(cmds.len(), 1);
    assert!(matches!(
        sent_to(&cmds, ChannelId(1))[..],
        [ChannelMsg::EstablishResponse { .. }]
    ));

    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::EstablishRequest {
            identity: peer("p2"),
        },
    );
    assert!(cmds.is_empty());
    assert_eq!(
        model.channels[&ChannelId(1)].identity().map(|i| i.peer_id.as_str()),
        Some("p1")
    );
}

#[test]
fn test_unestablished_channel_ignores_protocol_messages() {
    let (model, _) = update(
        initiator(),
        Message::ChannelAdded {
            channel_id: ChannelId(1),
            kind: ChannelKind::Network,
        },
    );
    let (model, cmds) = receive(model, ChannelId(1), ChannelMsg::DirectoryRequest);
    assert!(cmds.is_empty());
    let (_, cmds) = receive(
        model,
        ChannelId(9),
        sync_request("doc1", VersionVector::new(), true),
    );
    assert!(cmds.is_empty());
}

#[test]
fn test_directory_response_creates_placeholders() {
    let (model, cmds) = update_all(
        initiator(),
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
    assert_eq!(sends(&cmds), 1);

    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::DirectoryResponse {
            doc_ids: vec![doc("doc9")],
        },
    );
    assert!(model.documents.contains_key(&doc("doc9")));
    assert_eq!(awareness(&model, "doc9", ChannelId(1)), Some(Awareness::HasDoc));
    assert!(matches!(
        cmds[0],
        Command::CancelTimer { ref key } if *key == RequestKey::directory(ChannelId(1))
    ));
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&sync_request("doc9", VersionVector::new(), true)]
    );

    // Unavailable cannot undo what the directory told us
    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::SyncResponse {
            doc_id: doc("doc9"),
            transmission: Transmission::Unavailable,
            presence: None,
        },
    );
    assert_eq!(awareness(&model, "doc9", ChannelId(1)), Some(Awareness::HasDoc));
    assert_eq!(
        model.channel_doc_state(&doc("doc9"), ChannelId(1)).unwrap().loading,
        LoadingState::NotFound
    );
    assert!(cmds.iter().any(|cmd| matches!(cmd, Command::DocReady { .. })));
}

#[test]
fn test_unavailable_marks_unknown_channel_as_lacking() {
    let model = connect_peer(initiator(), ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, cmds) = update(model, Message::DocEnsure { doc_id: doc("doc1") });
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&sync_request("doc1", VersionVector::new(), true)]
    );
    assert!(!cmds.iter().any(|cmd| matches!(cmd, Command::DocReady { .. })));

    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::SyncResponse {
            doc_id: doc("doc1"),
            transmission: Transmission::Unavailable,
            presence: None,
        },
    );
    assert_eq!(awareness(&model, "doc1", ChannelId(1)), Some(Awareness::NoDoc));
    assert!(cmds.iter().any(|cmd| matches!(cmd, Command::DocReady { .. })));
}

#[test]
fn test_up_to_date_replay_is_silent() {
    let model = connect_peer(initiator(), ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, _) = update(model, Message::DocEnsure { doc_id: doc("doc1") });
    let response = ChannelMsg::SyncResponse {
        doc_id: doc("doc1"),
        transmission: Transmission::UpToDate {
            version: VersionVector::new(),
        },
        presence: None,
    };

    let (model, cmds) = receive(model, ChannelId(1), response.clone());
    assert_eq!(cmds.len(), 2);
    assert!(matches!(cmds[0], Command::CancelTimer { .. }));
    assert!(matches!(cmds[1], Command::DocReady { .. }));

    let (model, cmds) = receive(model, ChannelId(1), response);
    assert!(cmds.is_empty());
    assert_eq!(awareness(&model, "doc1", ChannelId(1)), Some(Awareness::HasDoc));
}

#[test]
fn test_local_change_pushes_to_holders_and_storage() {
    let (model, factory) = model_with_doc(TestModelBuilder::new("me"), "doc1", &[("k", json!(1))]);
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("holder"));
    let model = connect_peer(model, ChannelId(2), ChannelKind::Network, peer("stranger"));
    let model = connect_peer(
        model,
        ChannelId(3),
        ChannelKind::Storage,
        TestPeerBuilder::new("disk").with_kind(PeerKind::Service).build(),
    );
    let (model, _) = receive(model, ChannelId(1), sync_request("doc1", VersionVector::new(), false));

    factory.doc(&doc("doc1")).unwrap().set("k", json!(2)).unwrap();
    let (model, cmds) = update(model, Message::LocalDocChange { doc_id: doc("doc1") });

    let holder = sent_to(&cmds, ChannelId(1));
    assert_eq!(holder.len(), 1);
    let ChannelMsg::SyncResponse {
        transmission: Transmission::Update { version, .. },
        ..
    } = holder[0]
    else {
        panic!("expected update, got {:?}", holder[0]);
    };
    assert_eq!(version.get("me"), 2);

    assert!(sent_to(&cmds, ChannelId(2)).is_empty());
    assert!(matches!(
        sent_to(&cmds, ChannelId(3))[..],
        [ChannelMsg::SyncResponse {
            transmission: Transmission::Snapshot { .. },
            ..
        }]
    ));

    // Nothing new, nothing sent
    let (_, cmds) = update(model, Message::LocalDocChange { doc_id: doc("doc1") });
    assert!(cmds.is_empty());
}

#[test]
fn test_update_rule_drops_untrusted_writes() {
    let rules = Rules::new().with_can_update(|_, peer| peer.channel_kind == ChannelKind::Storage);
    let (model, factory) = model_with_doc(TestModelBuilder::new("me").with_rules(rules), "doc1", &[]);
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("p1"));

    let incoming: VersionVector = [("p1", 1u64)].into_iter().collect();
    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::SyncResponse {
            doc_id: doc("doc1"),
            transmission: Transmission::Snapshot {
                data: b"[]".to_vec(),
                version: incoming,
            },
            presence: None,
        },
    );
    assert!(!cmds.iter().any(|cmd| matches!(cmd, Command::Import { .. })));
    assert_eq!(awareness(&model, "doc1", ChannelId(1)), Some(Awareness::HasDoc));
    assert!(factory.doc(&doc("doc1")).unwrap().version().is_empty());
}

#[test]
fn test_create_rule() {
    let rules = Rules::new().with_can_create(|doc_id, _| doc_id.as_str().starts_with("shared/"));
    let model = connect_peer(
        TestModelBuilder::new("me").with_rules(rules).build().0,
        ChannelId(1),
        ChannelKind::Network,
        peer("p1"),
    );
    let theirs: VersionVector = [("p1", 2u64)].into_iter().collect();

    let (model, cmds) = receive(model, ChannelId(1), sync_request("private", theirs.clone(), true));
    assert!(!model.documents.contains_key(&doc("private")));
    assert!(matches!(
        sent_to(&cmds, ChannelId(1))[..],
        [ChannelMsg::SyncResponse {
            transmission: Transmission::Unavailable,
            ..
        }]
    ));

    let (model, cmds) = receive(model, ChannelId(1), sync_request("shared/notes", theirs, true));
    assert!(model.documents.contains_key(&doc("shared/notes")));
    let msgs = sent_to(&cmds, ChannelId(1));
    assert_eq!(msgs.len(), 2);
    assert!(matches!(
        msgs[0],
        ChannelMsg::SyncResponse {
            transmission: Transmission::UpToDate { .. },
            ..
        }
    ));
    assert_eq!(msgs[1], &sync_request("shared/notes", VersionVector::new(), false));
}

#[test]
fn test_peer_delete_respects_rule() {
    let rules = Rules::new().with_can_delete(|doc, _| doc.doc_id.as_str() != "keep");
    let (model, _) = model_with_doc(TestModelBuilder::new("me").with_rules(rules), "keep", &[]);
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, _) = update(model, Message::DocEnsure { doc_id: doc("drop") });

    let (model, cmds) = receive(model, ChannelId(1), ChannelMsg::DeleteRequest { doc_id: doc("keep") });
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&ChannelMsg::DeleteResponse {
            doc_id: doc("keep"),
            ok: false
        }]
    );
    assert!(model.documents.contains_key(&doc("keep")));

    // The pending sync for "drop" is cancelled along with the document
    let (model, cmds) = receive(model, ChannelId(1), ChannelMsg::DeleteRequest { doc_id: doc("drop") });
    assert!(cmds.iter().any(|cmd| matches!(
        cmd,
        Command::CancelTimer { key } if *key == RequestKey::sync(ChannelId(1), doc("drop"))
    )));
    assert!(cmds.iter().any(|cmd| matches!(
        cmd,
        Command::DocRemoved { doc_id } if doc_id == &doc("drop")
    )));
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&ChannelMsg::DeleteResponse {
            doc_id: doc("drop"),
            ok: true
        }]
    );
    assert!(!model.documents.contains_key(&doc("drop")));
    assert!(model.pending.is_empty());

    let (_, cmds) = receive(model, ChannelId(1), ChannelMsg::DeleteRequest { doc_id: doc("ghost") });
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&ChannelMsg::DeleteResponse {
            doc_id: doc("ghost"),
            ok: false
        }]
    );
}

#[test]
fn test_local_delete_notifies_holders() {
    let (model, _) = model_with_doc(TestModelBuilder::new("me"), "doc1", &[("k", json!(1))]);
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("holder"));
    let model = connect_peer(model, ChannelId(2), ChannelKind::Network, peer("stranger"));
    let (model, _) = receive(model, ChannelId(1), sync_request("doc1", VersionVector::new(), false));

    let (model, cmds) = update(model, Message::DocDelete { doc_id: doc("doc1") });
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&ChannelMsg::DeleteRequest { doc_id: doc("doc1") }]
    );
    assert!(sent_to(&cmds, ChannelId(2)).is_empty());
    assert!(matches!(cmds.last(), Some(Command::DocRemoved { .. })));
    assert!(model.documents.is_empty());

    let (_, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::DeleteResponse {
            doc_id: doc("doc1"),
            ok: true,
        },
    );
    assert!(cmds.is_empty());
}

#[test]
fn test_failed_channel_stops_receiving_pushes() {
    let (model, factory) = model_with_doc(TestModelBuilder::new("me"), "doc1", &[("k", json!(1))]);
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("holder"));
    let (model, _) = receive(model, ChannelId(1), sync_request("doc1", VersionVector::new(), false));
    let (model, _) = update(
        model,
        Message::ChannelFailed {
            channel_id: ChannelId(1),
            reason: "socket closed".to_string(),
        },
    );

    factory.doc(&doc("doc1")).unwrap().set("k", json!(2)).unwrap();
    let (model, cmds) = update(model, Message::LocalDocChange { doc_id: doc("doc1") });
    assert!(cmds.is_empty());
    assert_eq!(
        model.channels[&ChannelId(1)].connection_state,
        ConnectionState::Error
    );
}

#[test]
fn test_failed_import_marks_pairing_without_retry() {
    let model = connect_peer(initiator(), ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, _) = update(model, Message::DocEnsure { doc_id: doc("doc1") });
    let incoming: VersionVector = [("p1", 2u64)].into_iter().collect();
    let (model, cmds) = receive(
        model,
        ChannelId(1),
        ChannelMsg::SyncResponse {
            doc_id: doc("doc1"),
            transmission: Transmission::Snapshot {
                data: b"not a snapshot".to_vec(),
                version: incoming.clone(),
            },
            presence: None,
        },
    );
    assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Import { .. })));
    assert!(!cmds.iter().any(|cmd| matches!(cmd, Command::DocReady { .. })));

    let (model, cmds) = update(
        model,
        Message::ImportCompleted {
            channel_id: ChannelId(1),
            doc_id: doc("doc1"),
            peer_version: incoming,
            result: Err("missing dependencies".to_string()),
        },
    );
    assert_eq!(
        model.channel_doc_state(&doc("doc1"), ChannelId(1)).unwrap().loading,
        LoadingState::Failed {
            reason: "missing dependencies".to_string()
        }
    );
    assert!(cmds.iter().any(|cmd| matches!(cmd, Command::DocReady { .. })));
    assert_eq!(sends(&cmds), 0);
    assert!(!cmds
        .iter()
        .any(|cmd| matches!(cmd, Command::StartTimer { .. } | Command::Subscribe { .. })));

    // A stale deadline for the answered request does not bring it back
    let (model, cmds) = update(
        model,
        Message::Timeout {
            key: RequestKey::sync(ChannelId(1), doc("doc1")),
        },
    );
    assert!(cmds.is_empty());
    assert!(matches!(
        model.channel_doc_state(&doc("doc1"), ChannelId(1)).unwrap().loading,
        LoadingState::Failed { .. }
    ));
}

fn up_to_date(version: VersionVector) -> ChannelMsg {
    ChannelMsg::SyncResponse {
        doc_id: doc("doc1"),
        transmission: Transmission::UpToDate { version },
        presence: None,
    }
}

#[test]
fn test_up_to_date_catches_up_edits_made_in_flight() {
    let (model, registry) = TestModelBuilder::new("me").build();
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, cmds) = update(model, Message::DocEnsure { doc_id: doc("doc1") });
    assert_eq!(
        sent_to(&cmds, ChannelId(1)),
        vec![&sync_request("doc1", VersionVector::new(), true)]
    );

    registry.doc(&doc("doc1")).unwrap().set("k", json!(1)).unwrap();
    let (_, cmds) = receive(model, ChannelId(1), up_to_date(VersionVector::new()));
    assert!(matches!(
        sent_to(&cmds, ChannelId(1))[..],
        [ChannelMsg::SyncResponse {
            transmission: Transmission::Snapshot { .. },
            ..
        }]
    ));
}

#[test]
fn test_up_to_date_from_behind_peer_waits_for_its_request() {
    let (model, _) = model_with_doc(TestModelBuilder::new("me"), "doc1", &[("k", json!(1))]);
    let (model, cmds) = update_all(
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
    assert_eq!(sent_to(&cmds, ChannelId(1)).len(), 2);

    // The peer will ask back with its own version; no push in between
    let (model, cmds) = receive(model, ChannelId(1), up_to_date(VersionVector::new()));
    assert_eq!(sends(&cmds), 0);

    let (_, cmds) = receive(model, ChannelId(1), sync_request("doc1", VersionVector::new(), false));
    assert!(matches!(
        sent_to(&cmds, ChannelId(1))[..],
        [ChannelMsg::SyncResponse {
            transmission: Transmission::Snapshot { .. },
            ..
        }]
    ));
}

#[test]
fn test_rejected_send_fails_only_that_pairing() {
    let (model, registry) = model_with_doc(TestModelBuilder::new("me"), "doc1", &[("k", json!(1))]);
    let model = connect_peer(model, ChannelId(1), ChannelKind::Network, peer("p1"));
    let model = connect_peer(model, ChannelId(2), ChannelKind::Network, peer("p2"));
    let (model, _) = receive(model, ChannelId(1), sync_request("doc1", VersionVector::new(), false));
    let (model, _) = receive(model, ChannelId(2), sync_request("doc1", VersionVector::new(), false));

    let (model, cmds) = update(
        model,
        Message::SendRejected {
            channel_id: ChannelId(1),
            doc_id: Some(doc("doc1")),
            reason: "frame too large".to_string(),
        },
    );
    assert_eq!(sends(&cmds), 0);
    let state = model.channel_doc_state(&doc("doc1"), ChannelId(1)).unwrap();
    assert!(matches!(state.loading, LoadingState::Failed { .. }));
    assert!(state.last_known_version.is_empty());

    registry.doc(&doc("doc1")).unwrap().set("k", json!(2)).unwrap();
    let (model, cmds) = update(model, Message::LocalDocChange { doc_id: doc("doc1") });
    assert!(sent_to(&cmds, ChannelId(1)).is_empty());
    assert_eq!(sent_to(&cmds, ChannelId(2)).len(), 1);

    // The peer can still ask explicitly
    let (_, cmds) = receive(model, ChannelId(1), sync_request("doc1", VersionVector::new(), false));
    assert!(matches!(
        sent_to(&cmds, ChannelId(1))[..],
        [ChannelMsg::SyncResponse {
            transmission: Transmission::Snapshot { .. },
            ..
        }]
    ));
}

#[test]
fn test_rejected_send_without_document_is_ignored() {
    let model = connect_peer(initiator(), ChannelId(1), ChannelKind::Network, peer("p1"));
    let (model, cmds) = update(
        model,
        Message::SendRejected {
            channel_id: ChannelId(1),
            doc_id: None,
            reason: "frame too large".to_string(),
        },
    );
    assert!(cmds.is_empty());
    assert!(model.channels[&ChannelId(1)].is_usable());
}
