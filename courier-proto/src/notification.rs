//! Notification wire type and its read/delete lifecycle.
//!
//! A notification is `Created`, may become `Read`, and may be deleted from
//! either state. It never goes back to unread.

use serde::{Deserialize, Serialize};

use crate::ids::{NotificationId, Role, RoomKey, Timestamp, UserId};

/// Who caused a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    /// Sender's user ID.
    pub id: UserId,
    /// Sender's display name at the time the notification was raised.
    pub display_name: String,
}

/// A persisted notification addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier; clients dedup on it.
    pub id: NotificationId,
    /// The user this notification is for.
    pub recipient: UserId,
    /// The recipient's role.
    pub recipient_role: Role,
    /// Who caused it.
    pub sender: SenderRef,
    /// Text shown in the notification list.
    pub body: String,
    /// Set once the recipient reads it; never cleared.
    pub read: bool,
    /// The chat room this notification points at, if raised by a message.
    pub room: Option<RoomKey>,
    /// When it was raised.
    pub created_at: Timestamp,
}

impl Notification {
    /// Builds a new unread notification stamped with the current time.
    #[must_use]
    pub fn new(
        recipient: UserId,
        recipient_role: Role,
        sender: SenderRef,
        body: impl Into<String>,
        room: Option<RoomKey>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            recipient,
            recipient_role,
            sender,
            body: body.into(),
            read: false,
            room,
            created_at: Timestamp::now(),
        }
    }
}

/// Result of a mark-read request on an existing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOutcome {
    /// The flag went from unread to read.
    Marked,
    /// It was already read; nothing changed.
    AlreadyRead,
}
