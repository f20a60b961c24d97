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

//! Integration tests for reconnecting and re-registering.
//!
//! - `connect_with_retry` keeps trying until the relay comes up
//! - It gives up after `max_attempts` against a dead address
//! - A second registration of the same user takes over live pushes
//! - Notifications raised while away arrive in the next session's backlog

use std::time::{Duration, Instant};

use courier::reconnect::{ReconnectPolicy, connect_with_retry};
use courier::{ClientError, ClientEvent, Identity, RelayClient, Session};
use courier_proto::ids::{Role, UserId};

async fn start_relay() -> String {
    let (addr, _handle) = courier_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    format!("ws://{addr}/ws")
}

fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

fn identity(id: &str, role: Role) -> Identity {
    Identity::new(user(id), id.to_uppercase(), role)
}

async fn connect(url: &str, id: &str, role: Role) -> Session {
    RelayClient::connect(url, identity(id, role))
        .await
        .expect("connect failed")
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: Some(max_attempts),
    }
}

/// Reserve a free port and release it so something can bind it later.
async fn free_addr() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn retries_until_relay_comes_up() {
    let addr = free_addr().await;
    let url = format!("ws://{addr}/ws");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        courier_relay::relay::start_server(&addr.to_string())
            .await
            .expect("failed to start relay server");
    });

    let start = Instant::now();
    let session = connect_with_retry(&url, &identity("c1", Role::Client), &fast_policy(50))
        .await
        .unwrap();
    assert!(session.client.is_connected());
    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let addr = free_addr().await;
    let url = format!("ws://{addr}/ws");

    let start = Instant::now();
    let err = connect_with_retry(&url, &identity("c1", Role::Client), &fast_policy(3))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Unreachable(_)));
    // Two sleeps between three attempts: ~50ms then ~100ms, minus jitter.
    assert!(start.elapsed() >= Duration::from_millis(130));
}

#[tokio::test]
async fn second_registration_takes_over_pushes() {
    let url = start_relay().await;
    let mut first = connect(&url, "v1", Role::Vendor).await;
    let mut second = connect(&url, "v1", Role::Vendor).await;
    assert_ne!(first.client.connection(), second.client.connection());

    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));
    client
        .client
        .send_message(client.client.next_request_id(), &room, "which one?")
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), second.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ClientEvent::Notification(_)));

    let stale = tokio::time::timeout(Duration::from_millis(300), first.events.recv()).await;
    assert!(stale.is_err(), "superseded connection got {stale:?}");
}

#[tokio::test]
async fn backlog_after_reconnect_holds_missed_notifications() {
    let url = start_relay().await;
    let vendor = connect(&url, "v1", Role::Vendor).await;
    let mut events = vendor.events;
    vendor.client.close().await;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == ClientEvent::Disconnected {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let client = connect(&url, "c1", Role::Client).await;
    let room = client.client.room_with(&user("v1"));
    client
        .client
        .send_message(client.client.next_request_id(), &room, "while you were out")
        .await
        .unwrap();

    let session = connect_with_retry(&url, &identity("v1", Role::Vendor), &fast_policy(5))
        .await
        .unwrap();
    let bodies: Vec<_> = session.backlog.iter().map(|n| n.body.as_str()).collect();
    assert_eq!(bodies, ["while you were out"]);
}
