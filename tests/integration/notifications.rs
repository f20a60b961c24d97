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

//! Integration tests for the notification feed.
//!
//! - Notifications raised while a user is offline arrive as the backlog
//! - Read, delete and clear over the wire, including repeat calls
//! - System notifications raised over HTTP are pushed live
//! - The client cache merges backlog, pushes and re-drains without duplicates

use std::net::SocketAddr;
use std::time::Duration;

use courier::cache::NotificationCache;
use courier::{ClientError, ClientEvent, Identity, RelayClient, Session};
use courier_proto::ids::{Role, UserId};
use courier_proto::relay::Outcome;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn start_relay() -> SocketAddr {
    let (addr, _handle) = courier_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    addr
}

fn ws_url(addr: SocketAddr) -> String {
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

async fn next_event(session: &mut Session) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), session.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Sends `bodies` from c1 to the offline vendor v1.
async fn send_to_offline_vendor(url: &str, bodies: &[&str]) {
    let client = connect(url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));
    for body in bodies {
        client
            .client
            .send_message(client.client.next_request_id(), &room, *body)
            .await
            .unwrap();
    }
}

/// Minimal HTTP/1.1 POST with a JSON body; returns the raw response.
async fn post_json(addr: SocketAddr, path: &str, body: &serde_json::Value) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let body = body.to_string();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn offline_notifications_arrive_as_backlog_in_order() {
    let url = ws_url(start_relay().await);
    send_to_offline_vendor(&url, &["first", "second"]).await;

    let vendor = connect(&url, "v1", Role::Vendor).await;
    let bodies: Vec<_> = vendor.backlog.iter().map(|n| n.body.as_str()).collect();
    assert_eq!(bodies, ["first", "second"]);
    assert!(vendor.backlog.iter().all(|n| !n.read));
    assert!(vendor.backlog.iter().all(|n| n.recipient_role == Role::Vendor));

    // Draining is not destructive.
    let again = vendor.client.fetch_pending().await.unwrap();
    assert_eq!(again, vendor.backlog);
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let url = ws_url(start_relay().await);
    send_to_offline_vendor(&url, &["hello"]).await;

    let vendor = connect(&url, "v1", Role::Vendor).await;
    let id = vendor.backlog[0].id;
    vendor.client.mark_read(id).await.unwrap();
    vendor.client.mark_read(id).await.unwrap();

    let pending = vendor.client.fetch_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].read);
}

#[tokio::test]
async fn delete_removes_only_that_notification() {
    let url = ws_url(start_relay().await);
    send_to_offline_vendor(&url, &["keep", "drop"]).await;

    let vendor = connect(&url, "v1", Role::Vendor).await;
    let drop_id = vendor.backlog[1].id;
    vendor.client.delete_notification(drop_id).await.unwrap();

    let err = vendor.client.delete_notification(drop_id).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(vendor.client.mark_read(drop_id).await.unwrap_err().is_not_found());

    let pending = vendor.client.fetch_pending().await.unwrap();
    let bodies: Vec<_> = pending.iter().map(|n| n.body.as_str()).collect();
    assert_eq!(bodies, ["keep"]);
}

#[tokio::test]
async fn clear_removes_everything_and_only_for_self() {
    let url = ws_url(start_relay().await);
    send_to_offline_vendor(&url, &["a", "b", "c"]).await;

    let vendor = connect(&url, "v1", Role::Vendor).await;
    assert_eq!(vendor.backlog.len(), 3);

    let err = vendor
        .client
        .clear_notifications_for(&user("c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Request(Outcome::Rejected { .. })));

    vendor.client.clear_notifications().await.unwrap();
    assert!(vendor.client.fetch_pending().await.unwrap().is_empty());

    // Clearing an empty feed is fine.
    vendor.client.clear_notifications().await.unwrap();
}

#[tokio::test]
async fn notifications_cannot_be_touched_by_other_users() {
    let url = ws_url(start_relay().await);
    send_to_offline_vendor(&url, &["private"]).await;

    let vendor = connect(&url, "v1", Role::Vendor).await;
    let id = vendor.backlog[0].id;

    let other = connect(&url, "v2", Role::Vendor).await;
    assert!(other.client.mark_read(id).await.unwrap_err().is_not_found());
    assert!(other.client.delete_notification(id).await.unwrap_err().is_not_found());

    assert_eq!(vendor.client.fetch_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn http_system_notification_is_pushed_live() {
    let addr = start_relay().await;
    let mut vendor = connect(&ws_url(addr), "v1", Role::Vendor).await;

    let response = post_json(
        addr,
        "/api/notifications",
        &serde_json::json!({
            "recipient": "v1",
            "recipient_role": "vendor",
            "sender_id": "bookings",
            "sender_name": "Bookings",
            "body": "New booking request for Saturday",
        }),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 201"), "{response}");

    match next_event(&mut vendor).await {
        ClientEvent::Notification(n) => {
            assert_eq!(n.body, "New booking request for Saturday");
            assert_eq!(n.sender.id, user("bookings"));
            assert!(n.room.is_none());
        }
        other => panic!("expected Notification, got {other:?}"),
    }
}

#[tokio::test]
async fn http_invalid_recipient_is_bad_request() {
    let addr = start_relay().await;
    let response = post_json(
        addr,
        "/api/notifications",
        &serde_json::json!({
            "recipient": "",
            "recipient_role": "client",
            "sender_id": "bookings",
            "sender_name": "Bookings",
            "body": "hi",
        }),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn cache_merges_pushes_and_redrain_without_duplicates() {
    let url = ws_url(start_relay().await);
    send_to_offline_vendor(&url, &["queued"]).await;

    let mut vendor = connect(&url, "v1", Role::Vendor).await;
    let mut cache = NotificationCache::new();
    assert_eq!(cache.merge(vendor.backlog.clone()), 1);

    // A live push while connected.
    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));
    client
        .client
        .send_message(client.client.next_request_id(), &room, "live")
        .await
        .unwrap();
    let ClientEvent::Notification(pushed) = next_event(&mut vendor).await else {
        panic!("expected Notification");
    };
    assert!(cache.insert(pushed));

    // The re-drain overlaps both.
    let drained = vendor.client.fetch_pending().await.unwrap();
    assert_eq!(drained.len(), 2);
    assert_eq!(cache.merge(drained), 0);

    let bodies: Vec<_> = cache.list().iter().map(|n| n.body.as_str()).collect();
    assert_eq!(bodies, ["queued", "live"]);
    assert_eq!(cache.unread_count(), 2);
}
