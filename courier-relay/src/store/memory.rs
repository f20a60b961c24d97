//! In-memory storage backend.
//!
//! Keeps every room's messages in append order and every recipient's
//! notifications in creation order. Nothing survives a restart; use
//! [`super::sqlite::SqliteStore`] when that matters.

use std::collections::{HashMap, HashSet};

use courier_proto::ids::{MessageId, NotificationId, RoomKey, Timestamp, UserId};
use courier_proto::message::{ChatMessage, ChatSummary, MessageCursor, MessagePage, RoomCursor, RoomPage};
use courier_proto::notification::{Notification, ReadOutcome};
use tokio::sync::RwLock;

use super::{MessageDraft, MessageGateway, NotificationStore, StoreError, message_page, room_page};

#[derive(Default)]
struct MessageTables {
    last_id: u64,
    last_stamp: u64,
    rooms: HashMap<RoomKey, Vec<ChatMessage>>,
    rooms_by_user: HashMap<UserId, HashSet<RoomKey>>,
}

/// In-memory message and notification store.
///
/// Thread-safe via [`RwLock`]. Message IDs are a single increasing sequence
/// and timestamps never go backwards, so append order and
/// `(created_at, id)` order agree.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<MessageTables>,
    notifications: RwLock<HashMap<UserId, Vec<Notification>>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages across all rooms.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.rooms.values().map(Vec::len).sum()
    }
}

impl MessageGateway for MemoryStore {
    async fn append_message(&self, draft: MessageDraft) -> Result<ChatMessage, StoreError> {
        let mut tables = self.messages.write().await;
        tables.last_id += 1;
        tables.last_stamp = tables.last_stamp.max(Timestamp::now().as_millis());

        let message = ChatMessage {
            id: MessageId::new(tables.last_id),
            room: draft.room,
            sender: draft.sender,
            sender_role: draft.sender_role,
            body: draft.body,
            created_at: Timestamp::from_millis(tables.last_stamp),
        };

        let (low, high) = message.room.participants();
        let (low, high) = (low.clone(), high.clone());
        for user in [low, high] {
            tables
                .rooms_by_user
                .entry(user)
                .or_default()
                .insert(message.room.clone());
        }
        tables
            .rooms
            .entry(message.room.clone())
            .or_default()
            .push(message.clone());
        drop(tables);

        Ok(message)
    }

    async fn page_messages(
        &self,
        room: &RoomKey,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<MessagePage, StoreError> {
        let limit = limit.max(1);
        let tables = self.messages.read().await;
        let Some(messages) = tables.rooms.get(room) else {
            return Ok(MessagePage::default());
        };

        let end = cursor.map_or(messages.len(), |c| {
            messages.partition_point(|m| m.cursor() < c)
        });
        let rows = messages[..end].iter().rev().take(limit + 1).cloned().collect();
        drop(tables);

        Ok(message_page(rows, limit))
    }

    async fn list_rooms_for_user(
        &self,
        user: &UserId,
        cursor: Option<RoomCursor>,
        limit: usize,
    ) -> Result<RoomPage, StoreError> {
        let limit = limit.max(1);
        let tables = self.messages.read().await;
        let Some(keys) = tables.rooms_by_user.get(user) else {
            return Ok(RoomPage::default());
        };

        let mut summaries: Vec<ChatSummary> = keys
            .iter()
            .filter_map(|key| {
                let last = tables.rooms.get(key)?.last()?;
                let peer = key.other(user)?.clone();
                Some(ChatSummary {
                    room: key.clone(),
                    peer,
                    last_message: last.clone(),
                })
            })
            .filter(|s| cursor.is_none_or(|c| s.cursor() < c))
            .collect();
        drop(tables);

        summaries.sort_by(|a, b| b.cursor().cmp(&a.cursor()));
        summaries.truncate(limit + 1);
        Ok(room_page(summaries, limit))
    }
}

impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
        let mut all = self.notifications.write().await;
        let queue = all.entry(notification.recipient.clone()).or_default();
        if queue.iter().any(|n| n.id == notification.id) {
            return Err(StoreError::WriteFailed(format!(
                "duplicate notification id {}",
                notification.id
            )));
        }
        queue.push(notification.clone());
        drop(all);
        Ok(())
    }

    async fn pending(&self, recipient: &UserId) -> Result<Vec<Notification>, StoreError> {
        let all = self.notifications.read().await;
        Ok(all.get(recipient).cloned().unwrap_or_default())
    }

    async fn mark_read(
        &self,
        recipient: &UserId,
        id: NotificationId,
    ) -> Result<Option<ReadOutcome>, StoreError> {
        let mut all = self.notifications.write().await;
        let Some(notification) = all
            .get_mut(recipient)
            .and_then(|queue| queue.iter_mut().find(|n| n.id == id))
        else {
            return Ok(None);
        };
        if notification.read {
            return Ok(Some(ReadOutcome::AlreadyRead));
        }
        notification.read = true;
        drop(all);
        Ok(Some(ReadOutcome::Marked))
    }

    async fn delete(&self, recipient: &UserId, id: NotificationId) -> Result<bool, StoreError> {
        let mut all = self.notifications.write().await;
        let Some(queue) = all.get_mut(recipient) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|n| n.id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            all.remove(recipient);
        }
        drop(all);
        Ok(removed)
    }

    async fn clear(&self, recipient: &UserId) -> Result<usize, StoreError> {
        let mut all = self.notifications.write().await;
        Ok(all.remove(recipient).map_or(0, |queue| queue.len()))
    }
}
