//! Authoritative and relayed match flows.

mod common;

use arena_proto::{Payload, StreamMode};
use common::{TestClient, TestServer, free_port};
use serde_json::json;
use uuid::Uuid;

async fn create_match(
    client: &mut TestClient,
    name: Option<&str>,
    params: Option<serde_json::Value>,
) -> (Uuid, bool, String) {
    let reply = client
        .call(Payload::MatchCreate {
            name: name.map(str::to_string),
            params,
        })
        .await
        .unwrap();
    match reply.payload {
        Payload::Match {
            match_id,
            authoritative,
            label,
            ..
        } => (match_id, authoritative, label),
        other => panic!("expected Match reply, got {:?}", other.tag()),
    }
}

#[tokio::test]
async fn authoritative_echo_within_a_tick() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let (match_id, authoritative, label) = create_match(
        &mut alice,
        Some("echo"),
        Some(json!({"tick_rate": 10, "label": "open"})),
    )
    .await;
    assert!(authoritative);
    assert_eq!(label, "open");

    // Send op 7 with 32 bytes; the core answers op 8 with the same data.
    let data: Vec<u8> = (0u8..32).collect();
    alice
        .send(
            "",
            Payload::MatchDataSend {
                match_id,
                op_code: 7,
                data: data.clone(),
                presence_filter: vec![],
                reliable: true,
            },
        )
        .await
        .unwrap();

    let echoed = alice
        .recv_until(|env| matches!(&env.payload, Payload::MatchData { op_code: 8, .. }))
        .await
        .expect("echo broadcast");
    match echoed.payload {
        Payload::MatchData {
            op_code,
            data: received,
            presence,
            ..
        } => {
            assert_eq!(op_code, 8);
            assert_eq!(received, data);
            assert_eq!(presence.unwrap().user_id, alice.user_id);
        }
        _ => unreachable!(),
    }

    // A second client joins and is visible to the first.
    let mut bob = TestClient::connect(port, "bob").await.unwrap();
    let joined = bob
        .call(Payload::MatchJoin {
            match_id,
            metadata: Default::default(),
        })
        .await
        .unwrap();
    match joined.payload {
        Payload::Match { size, .. } => assert_eq!(size, 2),
        other => panic!("expected Match reply, got {:?}", other.tag()),
    }
    let bob_id = bob.user_id;
    alice
        .recv_until(|env| {
            matches!(
                &env.payload,
                Payload::MatchPresenceEvent { joins, .. }
                    if joins.iter().any(|p| p.user_id == bob_id)
            )
        })
        .await
        .expect("bob match join event");
}

#[tokio::test]
async fn join_attempt_rejection_is_permission_denied() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let (match_id, _, _) = create_match(
        &mut alice,
        Some("echo"),
        Some(json!({"tick_rate": 10, "max_players": 1})),
    )
    .await;

    let mut bob = TestClient::connect(port, "bob").await.unwrap();
    let rejected = bob
        .call(Payload::MatchJoin {
            match_id,
            metadata: Default::default(),
        })
        .await
        .unwrap();
    match rejected.payload {
        Payload::Error(err) => {
            assert_eq!(err.code, 7);
            assert!(err.message.contains("match full"));
        }
        other => panic!("expected rejection, got {:?}", other.tag()),
    }
}

#[tokio::test]
async fn unknown_match_name_is_invalid_argument() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let reply = alice
        .call(Payload::MatchCreate {
            name: Some("no-such-core".to_string()),
            params: None,
        })
        .await
        .unwrap();
    match reply.payload {
        Payload::Error(err) => assert_eq!(err.code, 3),
        other => panic!("expected error, got {:?}", other.tag()),
    }
}

#[tokio::test]
async fn relayed_match_fans_out_to_other_members() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let (match_id, authoritative, _) = create_match(&mut alice, None, None).await;
    assert!(!authoritative);

    let mut bob = TestClient::connect(port, "bob").await.unwrap();
    bob.call(Payload::MatchJoin {
        match_id,
        metadata: Default::default(),
    })
    .await
    .unwrap();

    bob.send(
        "",
        Payload::MatchDataSend {
            match_id,
            op_code: 5,
            data: b"relay".to_vec(),
            presence_filter: vec![],
            reliable: true,
        },
    )
    .await
    .unwrap();

    let received = alice
        .recv_until(|env| matches!(&env.payload, Payload::MatchData { op_code: 5, .. }))
        .await
        .expect("relayed data");
    match received.payload {
        Payload::MatchData { data, presence, .. } => {
            assert_eq!(data, b"relay".to_vec());
            assert_eq!(presence.unwrap().user_id, bob.user_id);
        }
        _ => unreachable!(),
    }

    // Leaving is acknowledged and the leaver drops from the presence set.
    let ack = bob.call(Payload::MatchLeave { match_id }).await.unwrap();
    assert!(matches!(ack.payload, Payload::Ack {}));
    let bob_id = bob.user_id;
    alice
        .recv_until(|env| {
            matches!(
                &env.payload,
                Payload::MatchPresenceEvent { leaves, .. }
                    if leaves.iter().any(|p| p.user_id == bob_id)
            )
        })
        .await
        .expect("bob leave event");
}

#[tokio::test]
async fn matchmaker_pairs_two_sessions() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let mut bob = TestClient::connect(port, "bob").await.unwrap();

    for client in [&mut alice, &mut bob] {
        let reply = client
            .call(Payload::MatchmakerAdd {
                min_count: 2,
                max_count: 2,
                query: vec![],
                string_properties: Default::default(),
                numeric_properties: Default::default(),
            })
            .await
            .unwrap();
        assert!(matches!(reply.payload, Payload::MatchmakerTicket { .. }));
    }

    // The pass runs every second in the test config.
    let matched = alice
        .recv_until(|env| matches!(&env.payload, Payload::MatchmakerMatched { .. }))
        .await
        .expect("matchmaker result");
    let match_id = match matched.payload {
        Payload::MatchmakerMatched {
            match_id, users, ..
        } => {
            assert_eq!(users.len(), 2);
            match_id.expect("match id")
        }
        _ => unreachable!(),
    };

    // Both sides can join the formed match.
    let joined = bob
        .call(Payload::MatchJoin {
            match_id,
            metadata: Default::default(),
        })
        .await
        .unwrap();
    assert!(matches!(joined.payload, Payload::Match { .. }));
}

#[tokio::test]
async fn match_data_to_unknown_match_is_not_found() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    // Data sends have no reply; errors still come back as envelopes.
    alice
        .send(
            "9",
            Payload::MatchDataSend {
                match_id: Uuid::new_v4(),
                op_code: 1,
                data: vec![],
                presence_filter: vec![],
                reliable: true,
            },
        )
        .await
        .unwrap();
    let reply = alice.recv_until(|env| env.cid == "9").await.unwrap();
    match reply.payload {
        Payload::Error(err) => assert_eq!(err.code, 5),
        other => panic!("expected NotFound, got {:?}", other.tag()),
    }

    // Chat join still works afterwards: the session survived the error.
    let joined = alice
        .call(Payload::ChannelJoin {
            target: "after-error".to_string(),
            mode: StreamMode::ChatRoom,
            persistence: false,
            hidden: false,
        })
        .await
        .unwrap();
    assert!(matches!(joined.payload, Payload::Channel { .. }));
}
