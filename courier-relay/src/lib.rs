//! Courier relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, registers users, routes two-party chat
//! messages through persistent storage and delivers or queues
//! notifications.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod lanes;
pub mod notifications;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod store;
