//! Shared protocol definitions for the Courier chat relay.
//!
//! Identifiers (including the canonical [`ids::RoomKey`]), persisted message
//! and notification types, the relay frame enums, and their postcard codec.

pub mod codec;
pub mod ids;
pub mod message;
pub mod notification;
pub mod relay;
