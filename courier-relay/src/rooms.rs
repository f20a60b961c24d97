//! Room router for the relay server.
//!
//! Tracks which connections have joined which two-party rooms and fans
//! frames out to them. Membership is runtime-only: a room has no record
//! beyond its stored messages, and a connection's joins vanish with it.

use std::collections::{HashMap, HashSet};

use courier_proto::ids::{ConnectionId, RoomKey};
use courier_proto::relay::ServerFrame;
use dashmap::DashMap;

use crate::registry::Handle;

/// Who a broadcast reached and who it could not.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Connections the frame was queued on.
    pub reached: Vec<ConnectionId>,
    /// Members whose writer task is gone.
    pub failed: Vec<Handle>,
}

/// Joined connections per room, plus the reverse index per connection.
#[derive(Default)]
pub struct RoomRouter {
    members: DashMap<RoomKey, HashMap<ConnectionId, Handle>>,
    joined: DashMap<ConnectionId, HashSet<RoomKey>>,
}

impl RoomRouter {
    /// Creates a router with no rooms.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle` to `room`. Returns `false` if it was already a member.
    pub fn join(&self, handle: &Handle, room: RoomKey) -> bool {
        let added = self
            .members
            .entry(room.clone())
            .or_default()
            .insert(handle.connection(), handle.clone())
            .is_none();
        self.joined
            .entry(handle.connection())
            .or_default()
            .insert(room);
        added
    }

    /// Removes `connection` from `room`. Returns whether it was a member.
    pub fn leave(&self, connection: ConnectionId, room: &RoomKey) -> bool {
        if let Some(mut rooms) = self.joined.get_mut(&connection) {
            rooms.remove(room);
        }
        self.joined.remove_if(&connection, |_, rooms| rooms.is_empty());
        self.remove_member(room, connection)
    }

    /// Removes `connection` from every room it joined.
    pub fn leave_all(&self, connection: ConnectionId) -> Vec<RoomKey> {
        let Some((_, rooms)) = self.joined.remove(&connection) else {
            return Vec::new();
        };
        for room in &rooms {
            self.remove_member(room, connection);
        }
        rooms.into_iter().collect()
    }

    fn remove_member(&self, room: &RoomKey, connection: ConnectionId) -> bool {
        let removed = self
            .members
            .get_mut(room)
            .is_some_and(|mut members| members.remove(&connection).is_some());
        self.members.remove_if(room, |_, members| members.is_empty());
        removed
    }

    /// Whether `connection` has joined `room`.
    #[must_use]
    pub fn is_member(&self, room: &RoomKey, connection: ConnectionId) -> bool {
        self.members
            .get(room)
            .is_some_and(|members| members.contains_key(&connection))
    }

    /// Number of connections joined to `room`.
    #[must_use]
    pub fn member_count(&self, room: &RoomKey) -> usize {
        self.members.get(room).map_or(0, |members| members.len())
    }

    /// Rooms `connection` has joined.
    #[must_use]
    pub fn rooms_of(&self, connection: ConnectionId) -> Vec<RoomKey> {
        self.joined
            .get(&connection)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queues `frame` on every member of `room` except `exclude`.
    pub fn broadcast(
        &self,
        room: &RoomKey,
        frame: &ServerFrame,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let targets: Vec<Handle> = self
            .members
            .get(room)
            .map(|members| {
                members
                    .values()
                    .filter(|h| Some(h.connection()) != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut report = BroadcastReport::default();
        for handle in targets {
            if handle.send(frame.clone()).is_ok() {
                report.reached.push(handle.connection());
            } else {
                report.failed.push(handle);
            }
        }
        tracing::debug!(
            room = %room,
            reached = report.reached.len(),
            failed = report.failed.len(),
            "broadcast"
        );
        report
    }
}
