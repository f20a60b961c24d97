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

//! Integration tests for history and chat-list paging over the wire.

use std::collections::HashSet;

use courier::cache::ConversationCache;
use courier::{ClientError, Identity, RelayClient, Session};
use courier_proto::ids::{Role, RoomKey, UserId};
use courier_proto::relay::Outcome;

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

async fn send(session: &Session, room: &RoomKey, body: &str) {
    session
        .client
        .send_message(session.client.next_request_id(), room, body)
        .await
        .unwrap();
}

#[tokio::test]
async fn paging_250_messages_by_50_yields_5_pages() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));
    for i in 0..250 {
        send(&client, &room, &format!("m{i}")).await;
    }

    let mut cache = ConversationCache::new();
    let mut seen = HashSet::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = client.client.fetch_history(&room, cursor, 50).await.unwrap();
        pages += 1;
        assert_eq!(page.messages.len(), 50);
        assert!(
            page.messages
                .windows(2)
                .all(|w| w[0].cursor() > w[1].cursor()),
            "page is not newest first"
        );
        for m in &page.messages {
            assert!(seen.insert(m.id), "duplicate message {}", m.id);
        }
        cache.merge_page(&page);

        if !page.has_more {
            assert!(page.next_cursor.is_none());
            break;
        }
        assert_eq!(
            page.next_cursor,
            page.messages.last().map(courier_proto::message::ChatMessage::cursor)
        );
        cursor = page.next_cursor;
    }

    assert_eq!(pages, 5);
    assert_eq!(seen.len(), 250);
    assert_eq!(cache.confirmed_len(&room), 250);
}

#[tokio::test]
async fn history_is_kept_without_listeners() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));
    for body in ["one", "two", "three"] {
        send(&client, &room, body).await;
    }

    let vendor = connect(&url, "v1", Role::Vendor).await;
    let page = vendor.client.fetch_history(&room, None, 0).await.unwrap();
    let bodies: Vec<_> = page.messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["three", "two", "one"]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn chat_list_is_ordered_by_latest_message() {
    let url = start_relay().await;
    let client = connect(&url, "c1", Role::Client).await;
    for vendor in ["v1", "v2", "v3"] {
        send(&client, &client.client.room_with(&user(vendor)), "hi").await;
    }
    // v1 becomes the most recent again.
    send(&client, &client.client.room_with(&user("v1")), "again").await;

    let first = client.client.list_rooms(None, 2).await.unwrap();
    let peers: Vec<_> = first.rooms.iter().map(|r| r.peer.as_str()).collect();
    assert_eq!(peers, ["v1", "v3"]);
    assert_eq!(first.rooms[0].last_message.body, "again");
    assert!(first.has_more);

    let second = client.client.list_rooms(first.next_cursor, 2).await.unwrap();
    let peers: Vec<_> = second.rooms.iter().map(|r| r.peer.as_str()).collect();
    assert_eq!(peers, ["v2"]);
    assert!(!second.has_more);
    assert!(second.next_cursor.is_none());

    // The vendor side sees only its own room.
    let vendor = connect(&url, "v2", Role::Vendor).await;
    let page = vendor.client.list_rooms(None, 10).await.unwrap();
    assert_eq!(page.rooms.len(), 1);
    assert_eq!(page.rooms[0].peer, user("c1"));
}

#[tokio::test]
async fn foreign_history_is_rejected() {
    let url = start_relay().await;
    let outsider = connect(&url, "c9", Role::Client).await;
    let room = RoomKey::between(&user("c1"), &user("v1"));

    let err = outsider
        .client
        .fetch_history(&room, None, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Request(Outcome::Rejected { .. })));
}
