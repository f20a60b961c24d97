//! Durable storage for chat messages and notifications.
//!
//! Defines the [`MessageGateway`] and [`NotificationStore`] traits the relay
//! core consumes, plus two implementations:
//! - [`memory::MemoryStore`]: in-process store, the default and test backend
//! - [`sqlite::SqliteStore`]: persistent storage through an `sqlx` pool
//!
//! The store is the system of record. The relay never mutates a stored
//! message; it only appends and pages.

pub mod memory;
pub mod sqlite;

use std::future::Future;

use courier_proto::ids::{NotificationId, Role, RoomKey, UserId};
use courier_proto::message::{
    ChatMessage, ChatSummary, MessageCursor, MessagePage, RoomCursor, RoomPage,
};
use courier_proto::notification::{Notification, ReadOutcome};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// A stored row could not be turned back into a domain value.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A message as submitted by a sender, before the store assigns its ID and
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Target room.
    pub room: RoomKey,
    /// Sending user.
    pub sender: UserId,
    /// Sender's role.
    pub sender_role: Role,
    /// Message text (already validated).
    pub body: String,
}

/// Storage contract for chat messages.
pub trait MessageGateway: Send + Sync + 'static {
    /// Durably persists a message and returns it with its assigned ID and
    /// timestamp. Within a room, later appends always sort after earlier ones.
    fn append_message(
        &self,
        draft: MessageDraft,
    ) -> impl Future<Output = Result<ChatMessage, StoreError>> + Send;

    /// Returns up to `limit` messages of `room` strictly older than `cursor`
    /// (or the newest ones when `cursor` is `None`), newest first.
    fn page_messages(
        &self,
        room: &RoomKey,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> impl Future<Output = Result<MessagePage, StoreError>> + Send;

    /// Returns up to `limit` chat summaries for rooms `user` participates in,
    /// most recently active first, starting strictly after `cursor`.
    fn list_rooms_for_user(
        &self,
        user: &UserId,
        cursor: Option<RoomCursor>,
        limit: usize,
    ) -> impl Future<Output = Result<RoomPage, StoreError>> + Send;
}

/// Storage contract for notifications.
///
/// Implementations need not serialize per recipient themselves; the
/// [`crate::notifications::NotificationQueue`] does that.
pub trait NotificationStore: Send + Sync + 'static {
    /// Appends a notification to its recipient's collection.
    fn insert(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All notifications of `recipient` that have not been deleted, in
    /// creation order.
    fn pending(
        &self,
        recipient: &UserId,
    ) -> impl Future<Output = Result<Vec<Notification>, StoreError>> + Send;

    /// Sets the read flag. `None` if no such notification belongs to
    /// `recipient`.
    fn mark_read(
        &self,
        recipient: &UserId,
        id: NotificationId,
    ) -> impl Future<Output = Result<Option<ReadOutcome>, StoreError>> + Send;

    /// Removes one notification. Returns whether it existed.
    fn delete(
        &self,
        recipient: &UserId,
        id: NotificationId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Removes all notifications of `recipient`, returning how many there were.
    fn clear(&self, recipient: &UserId) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// A backend providing both storage contracts.
pub trait Storage: MessageGateway + NotificationStore {}

impl<T: MessageGateway + NotificationStore> Storage for T {}

/// Builds a [`MessagePage`] from up to `limit + 1` rows fetched newest first.
///
/// The extra row only signals that more history exists; it is not returned.
pub(crate) fn message_page(mut rows: Vec<ChatMessage>, limit: usize) -> MessagePage {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = if has_more {
        rows.last().map(ChatMessage::cursor)
    } else {
        None
    };
    MessagePage {
        messages: rows,
        next_cursor,
        has_more,
    }
}

/// Builds a [`RoomPage`] from up to `limit + 1` summaries, most recent first.
pub(crate) fn room_page(mut rows: Vec<ChatSummary>, limit: usize) -> RoomPage {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = if has_more {
        rows.last().map(ChatSummary::cursor)
    } else {
        None
    };
    RoomPage {
        rooms: rows,
        next_cursor,
        has_more,
    }
}
