// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for live message delivery through a real relay.
//!
//! - Joined participants receive `NewMessage`; the sender gets `Sent`
//! - A connected third party never sees another room's traffic
//! - A connected participant who has not joined gets a notification instead
//! - Optimistic echoes are reconciled by the `Sent` reply

use std::time::Duration;

use courier::cache::{ConversationCache, ConversationEntry};
use courier::{ClientEvent, Identity, RelayClient, Session};
use courier_proto::ids::{Role, RoomKey, UserId};
use courier_proto::relay::Outcome;

/// Start a relay server on an OS-assigned port and return its WebSocket URL.
async fn start_relay() -> String {
    let (addr, _handle) = courier_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    format!("ws://{addr}/ws")
}

fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

async fn connect(url: &str, id: &str, role: Role) -> Session {
    RelayClient::connect(url, Identity::new(user(id), id.to_uppercase(), role))
        .await
        .expect("connect failed")
}

/// Wait for the next event, failing the test after 5 seconds.
async fn next_event(session: &mut Session) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), session.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert that no event arrives within a short window.
async fn assert_quiet(session: &mut Session) {
    let result = tokio::time::timeout(Duration::from_millis(300), session.events.recv()).await;
    assert!(result.is_err(), "unexpected event: {result:?}");
}

#[tokio::test]
async fn joined_peer_receives_message_and_third_party_does_not() {
    let url = start_relay().await;
    let mut client = connect(&url, "c1", Role::Client).await;
    let mut vendor = connect(&url, "v1", Role::Vendor).await;
    let mut bystander = connect(&url, "v2", Role::Vendor).await;

    let room = client.client.room_with(&user("v1"));
    client.client.join_room(&room).await.unwrap();
    vendor.client.join_room(&room).await.unwrap();

    let request_id = client.client.next_request_id();
    let sent = client
        .client
        .send_message(request_id, &room, "is Saturday free?")
        .await
        .unwrap();
    assert_eq!(sent.sender, user("c1"));
    assert_eq!(sent.room, room);

    match next_event(&mut vendor).await {
        ClientEvent::NewMessage { room: r, message } => {
            assert_eq!(r, room);
            assert_eq!(message, sent);
        }
        other => panic!("expected NewMessage, got {other:?}"),
    }

    // The sender's own connection is excluded from the broadcast.
    assert_quiet(&mut client).await;
    assert_quiet(&mut bystander).await;
}

#[tokio::test]
async fn connected_but_not_joined_gets_notification() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let mut vendor = connect(&url, "v1", Role::Vendor).await;

    let room = client.client.room_with(&user("v1"));
    client.client.join_room(&room).await.unwrap();
    let sent = client
        .client
        .send_message(client.client.next_request_id(), &room, "hello there")
        .await
        .unwrap();

    match next_event(&mut vendor).await {
        ClientEvent::Notification(n) => {
            assert_eq!(n.recipient, user("v1"));
            assert_eq!(n.recipient_role, Role::Vendor);
            assert_eq!(n.sender.id, user("c1"));
            assert_eq!(n.sender.display_name, "C1");
            assert_eq!(n.room, Some(room.clone()));
            assert_eq!(n.body, "hello there");
            assert!(!n.read);
        }
        other => panic!("expected Notification, got {other:?}"),
    }
    assert_quiet(&mut vendor).await;

    vendor.client.join_room(&room).await.unwrap();
    let page = vendor.client.fetch_history(&room, None, 10).await.unwrap();
    assert_eq!(page.messages, vec![sent]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn joined_peer_gets_no_notification() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let mut vendor = connect(&url, "v1", Role::Vendor).await;

    let room = client.client.room_with(&user("v1"));
    vendor.client.join_room(&room).await.unwrap();
    client
        .client
        .send_message(client.client.next_request_id(), &room, "ping")
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut vendor).await,
        ClientEvent::NewMessage { .. }
    ));
    assert_quiet(&mut vendor).await;
    assert!(vendor.client.fetch_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn listeners_see_messages_in_persistence_order() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let mut vendor = connect(&url, "v1", Role::Vendor).await;

    let room = client.client.room_with(&user("v1"));
    vendor.client.join_room(&room).await.unwrap();

    for i in 0..20 {
        client
            .client
            .send_message(client.client.next_request_id(), &room, format!("m{i}"))
            .await
            .unwrap();
    }

    let mut previous = None;
    for i in 0..20 {
        let ClientEvent::NewMessage { message, .. } = next_event(&mut vendor).await else {
            panic!("expected NewMessage");
        };
        assert_eq!(message.body, format!("m{i}"));
        assert!(previous < Some(message.cursor()));
        previous = Some(message.cursor());
    }
}

#[tokio::test]
async fn sent_echo_replaces_optimistic_entry() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));

    let mut cache = ConversationCache::new();
    let request_id = client.client.next_request_id();
    cache.push_optimistic(room.clone(), request_id, "on my way");
    assert!(matches!(
        cache.entries(&room).as_slice(),
        [ConversationEntry::Pending(_)]
    ));

    let message = client
        .client
        .send_message(request_id, &room, "on my way")
        .await
        .unwrap();
    assert!(cache.confirm(request_id, message.clone()));

    let entries = cache.entries(&room);
    assert_eq!(entries, vec![ConversationEntry::Confirmed(&message)]);
}

#[tokio::test]
async fn outsiders_cannot_join_or_send() {
    let url = start_relay().await;
    let outsider = connect(&url, "c9", Role::Client).await;
    let room = RoomKey::between(&user("c1"), &user("v1"));

    let err = outsider.client.join_room(&room).await.unwrap_err();
    assert!(matches!(
        err,
        courier::ClientError::Request(Outcome::Rejected { .. })
    ));

    let err = outsider
        .client
        .send_message(outsider.client.next_request_id(), &room, "hi")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        courier::ClientError::Request(Outcome::Rejected { .. })
    ));
}

#[tokio::test]
async fn empty_body_is_rejected_and_not_persisted() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));

    let err = client
        .client
        .send_message(client.client.next_request_id(), &room, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, courier::ClientError::Request(_)));

    let page = client.client.fetch_history(&room, None, 10).await.unwrap();
    assert!(page.messages.is_empty());
}
