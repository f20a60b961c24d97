//! Per-session client caches.
//!
//! Notifications arrive three ways: in the registration backlog, as live
//! pushes, and from explicit re-drains. They overlap freely, so the cache is
//! a set keyed by [`NotificationId`]. Conversations hold persisted messages
//! keyed by their room position, plus optimistic echoes of messages that
//! are still in flight.

use std::collections::{BTreeMap, HashMap};

use courier_proto::ids::{NotificationId, RoomKey};
use courier_proto::message::{ChatMessage, MessageCursor, MessagePage};
use courier_proto::notification::Notification;
use courier_proto::relay::RequestId;

/// Deduplicating set of notifications, listed oldest first.
#[derive(Debug, Default, Clone)]
pub struct NotificationCache {
    entries: HashMap<NotificationId, Notification>,
}

impl NotificationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes one notification. Returns `true` if it was new.
    ///
    /// A locally read notification stays read even if a stale copy arrives.
    pub fn insert(&mut self, notification: Notification) -> bool {
        match self.entries.get_mut(&notification.id) {
            Some(existing) => {
                let read = existing.read || notification.read;
                *existing = notification;
                existing.read = read;
                false
            }
            None => {
                self.entries.insert(notification.id, notification);
                true
            }
        }
    }

    /// Merges a batch (backlog or re-drain). Returns how many were new.
    pub fn merge(&mut self, notifications: impl IntoIterator<Item = Notification>) -> usize {
        notifications
            .into_iter()
            .map(|n| self.insert(n))
            .filter(|added| *added)
            .count()
    }

    /// Replaces the cache with an authoritative drain, keeping local read
    /// flags for notifications that survive.
    pub fn replace(&mut self, notifications: Vec<Notification>) {
        let previous = std::mem::take(&mut self.entries);
        for mut n in notifications {
            if previous.get(&n.id).is_some_and(|p| p.read) {
                n.read = true;
            }
            self.entries.insert(n.id, n);
        }
    }

    /// Sets the read flag locally. Returns `false` if the ID is unknown.
    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        let Some(n) = self.entries.get_mut(&id) else {
            return false;
        };
        n.read = true;
        true
    }

    /// Removes one notification.
    pub fn remove(&mut self, id: NotificationId) -> Option<Notification> {
        self.entries.remove(&id)
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn contains(&self, id: NotificationId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of unread notifications, for a badge.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.entries.values().filter(|n| !n.read).count()
    }

    /// All notifications ordered by creation time, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<&Notification> {
        let mut list: Vec<_> = self.entries.values().collect();
        list.sort_by_key(|n| (n.created_at, n.id));
        list
    }
}

/// A message that was sent but not yet confirmed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEcho {
    /// Correlation ID of the `SendMessage`.
    pub request_id: RequestId,
    /// The text as typed.
    pub body: String,
}

/// One line of a rendered conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEntry<'a> {
    /// Persisted by the relay.
    Confirmed(&'a ChatMessage),
    /// Still in flight.
    Pending(&'a PendingEcho),
}

#[derive(Debug, Default, Clone)]
struct Conversation {
    messages: BTreeMap<MessageCursor, ChatMessage>,
    pending: Vec<PendingEcho>,
}

/// Messages per room, oldest first, deduplicated by message position.
#[derive(Debug, Default, Clone)]
pub struct ConversationCache {
    rooms: HashMap<RoomKey, Conversation>,
}

impl ConversationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shows `body` immediately while the send is in flight.
    pub fn push_optimistic(&mut self, room: RoomKey, request_id: RequestId, body: impl Into<String>) {
        self.rooms.entry(room).or_default().pending.push(PendingEcho {
            request_id,
            body: body.into(),
        });
    }

    /// Replaces the optimistic entry for `request_id` with the persisted
    /// message. Returns `false` if there was no such entry.
    pub fn confirm(&mut self, request_id: RequestId, message: ChatMessage) -> bool {
        let conversation = self.rooms.entry(message.room.clone()).or_default();
        let before = conversation.pending.len();
        conversation.pending.retain(|p| p.request_id != request_id);
        let found = conversation.pending.len() != before;
        conversation.messages.insert(message.cursor(), message);
        found
    }

    /// Drops the optimistic entry of a failed send and returns it, so the
    /// caller can offer a retry.
    pub fn fail(&mut self, room: &RoomKey, request_id: RequestId) -> Option<PendingEcho> {
        let conversation = self.rooms.get_mut(room)?;
        let index = conversation
            .pending
            .iter()
            .position(|p| p.request_id == request_id)?;
        Some(conversation.pending.remove(index))
    }

    /// Adds a persisted message (live push or history). Returns `true` if
    /// it was not already cached.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        self.rooms
            .entry(message.room.clone())
            .or_default()
            .messages
            .insert(message.cursor(), message)
            .is_none()
    }

    /// Adds every message of a history page. Returns how many were new.
    pub fn merge_page(&mut self, page: &MessagePage) -> usize {
        page.messages
            .iter()
            .map(|m| self.insert(m.clone()))
            .filter(|added| *added)
            .count()
    }

    /// Cursor of the oldest cached message, for fetching older history.
    #[must_use]
    pub fn oldest_cursor(&self, room: &RoomKey) -> Option<MessageCursor> {
        self.rooms
            .get(room)
            .and_then(|c| c.messages.keys().next().copied())
    }

    /// Number of persisted messages cached for `room`.
    #[must_use]
    pub fn confirmed_len(&self, room: &RoomKey) -> usize {
        self.rooms.get(room).map_or(0, |c| c.messages.len())
    }

    /// The conversation in display order: persisted messages oldest first,
    /// then in-flight echoes in send order.
    #[must_use]
    pub fn entries(&self, room: &RoomKey) -> Vec<ConversationEntry<'_>> {
        let Some(conversation) = self.rooms.get(room) else {
            return Vec::new();
        };
        conversation
            .messages
            .values()
            .map(ConversationEntry::Confirmed)
            .chain(conversation.pending.iter().map(ConversationEntry::Pending))
            .collect()
    }
}
