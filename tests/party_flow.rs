//! Party lifecycle: open joins, approval flow, promotion, data fan-out.

mod common;

use arena_proto::Payload;
use common::{TestClient, TestServer, free_port};
use uuid::Uuid;

async fn create_party(client: &mut TestClient, open: bool, max_size: u32) -> Uuid {
    let reply = client
        .call(Payload::PartyCreate { open, max_size })
        .await
        .unwrap();
    match reply.payload {
        Payload::Party { party_id, .. } => party_id,
        other => panic!("expected Party reply, got {:?}", other.tag()),
    }
}

#[tokio::test]
async fn open_party_join_promote_and_data() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let mut bob = TestClient::connect(port, "bob").await.unwrap();

    let party_id = create_party(&mut alice, true, 4).await;

    let joined = bob.call(Payload::PartyJoin { party_id }).await.unwrap();
    match &joined.payload {
        Payload::Party {
            party_id: replied_id,
            self_presence,
            leader,
            ..
        } => {
            assert_eq!(*replied_id, party_id);
            assert_eq!(self_presence.user_id, bob.user_id);
            // Alice still leads.
            assert_ne!(*leader, self_presence.id);
        }
        other => panic!("expected Party reply, got {:?}", other.tag()),
    }

    let bob_id = bob.user_id;
    alice
        .recv_until(|env| {
            matches!(
                &env.payload,
                Payload::PartyPresenceEvent { joins, .. }
                    if joins.iter().any(|p| p.user_id == bob_id)
            )
        })
        .await
        .expect("bob party join event");

    // Promote Bob; both members observe the new leader.
    let bob_presence = match joined.payload {
        Payload::Party { self_presence, .. } => self_presence,
        _ => unreachable!(),
    };
    let ack = alice
        .call(Payload::PartyPromote {
            party_id,
            presence: bob_presence.id.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(ack.payload, Payload::Ack {}));
    bob.recv_until(|env| {
        matches!(
            &env.payload,
            Payload::PartyLeader { presence, .. } if *presence == bob_presence.id
        )
    })
    .await
    .expect("leader change event");

    // Party data reaches the other member.
    bob.send(
        "",
        Payload::PartyDataSend {
            party_id,
            op_code: 3,
            data: b"gg".to_vec(),
        },
    )
    .await
    .unwrap();
    let data = alice
        .recv_until(|env| matches!(&env.payload, Payload::PartyData { op_code: 3, .. }))
        .await
        .unwrap();
    match data.payload {
        Payload::PartyData { data, .. } => assert_eq!(data, b"gg".to_vec()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn closed_party_approval_flow() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let mut bob = TestClient::connect(port, "bob").await.unwrap();

    let party_id = create_party(&mut alice, false, 4).await;

    // Bob's join is held for approval.
    let pending = bob.call(Payload::PartyJoin { party_id }).await.unwrap();
    assert!(matches!(pending.payload, Payload::Ack {}));

    let request = alice
        .recv_until(|env| matches!(&env.payload, Payload::PartyJoinRequest { .. }))
        .await
        .expect("join request for leader");
    let bob_presence = match request.payload {
        Payload::PartyJoinRequest { presences, .. } => presences[0].clone(),
        _ => unreachable!(),
    };

    let ack = alice
        .call(Payload::PartyAccept {
            party_id,
            presence: bob_presence.id,
        })
        .await
        .unwrap();
    assert!(matches!(ack.payload, Payload::Ack {}));

    // Bob lands on the party stream once accepted.
    let bob_id = bob.user_id;
    bob.recv_until(|env| {
        matches!(
            &env.payload,
            Payload::PartyPresenceEvent { joins, .. }
                if joins.iter().any(|p| p.user_id == bob_id)
        )
    })
    .await
    .expect("bob sees own admission");
}

#[tokio::test]
async fn leader_leave_promotes_remaining_member() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let mut bob = TestClient::connect(port, "bob").await.unwrap();

    let party_id = create_party(&mut alice, true, 4).await;
    let joined = bob.call(Payload::PartyJoin { party_id }).await.unwrap();
    let bob_presence = match joined.payload {
        Payload::Party { self_presence, .. } => self_presence,
        other => panic!("expected Party reply, got {:?}", other.tag()),
    };

    let ack = alice.call(Payload::PartyLeave { party_id }).await.unwrap();
    assert!(matches!(ack.payload, Payload::Ack {}));

    bob.recv_until(|env| {
        matches!(
            &env.payload,
            Payload::PartyLeader { presence, .. } if *presence == bob_presence.id
        )
    })
    .await
    .expect("promotion on leader leave");
}

#[tokio::test]
async fn non_member_party_data_is_denied() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("spawn server");

    let mut alice = TestClient::connect(port, "alice").await.unwrap();
    let mut mallory = TestClient::connect(port, "mallory").await.unwrap();

    let party_id = create_party(&mut alice, true, 4).await;

    mallory
        .send(
            "5",
            Payload::PartyDataSend {
                party_id,
                op_code: 1,
                data: vec![],
            },
        )
        .await
        .unwrap();
    let reply = mallory.recv_until(|env| env.cid == "5").await.unwrap();
    match reply.payload {
        Payload::Error(err) => assert_eq!(err.code, 7),
        other => panic!("expected PermissionDenied, got {:?}", other.tag()),
    }
}
