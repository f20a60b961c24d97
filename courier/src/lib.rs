//! Courier client library.
//!
//! A WebSocket client for the Courier relay ([`client`]), per-session caches
//! that merge backlog, pushes and history without duplicates ([`cache`]),
//! and reconnect backoff ([`reconnect`]).

pub mod cache;
pub mod client;
pub mod reconnect;

pub use client::{ClientError, ClientEvent, Identity, RelayClient, Session};
