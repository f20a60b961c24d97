//! Chat message and history-page wire types.
//!
//! Messages are created by the relay's store; clients only ever see the
//! persisted form. Pages are cursor-based and walk backwards in time.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, Role, RoomKey, Timestamp, UserId};

/// Default maximum allowed message body size in bytes (16 KB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024;

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Room the message was sent to.
    pub room: RoomKey,
    /// Who sent it.
    pub sender: UserId,
    /// The sender's role at send time.
    pub sender_role: Role,
    /// Message text.
    pub body: String,
    /// Store-assigned creation time.
    pub created_at: Timestamp,
}

impl ChatMessage {
    /// The position of this message in its room's ordering.
    #[must_use]
    pub const fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Position in a room's `(created_at, id)` ordering.
///
/// Used as an exclusive upper bound: a page requested with a cursor holds
/// only messages strictly older than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageCursor {
    /// Creation time of the boundary message.
    pub created_at: Timestamp,
    /// ID of the boundary message, breaking timestamp ties.
    pub id: MessageId,
}

/// One page of room history, newest message first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePage {
    /// Messages in descending `(created_at, id)` order.
    pub messages: Vec<ChatMessage>,
    /// Cursor to request the next (older) page; `None` when `has_more` is false.
    pub next_cursor: Option<MessageCursor>,
    /// Whether older messages exist beyond this page.
    pub has_more: bool,
}

/// Latest-activity summary of one room, for rendering a chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// The room.
    pub room: RoomKey,
    /// The participant other than the user who asked.
    pub peer: UserId,
    /// The most recent message in the room.
    pub last_message: ChatMessage,
}

impl ChatSummary {
    /// Ordering position of this summary in a chat list.
    #[must_use]
    pub const fn cursor(&self) -> RoomCursor {
        RoomCursor {
            created_at: self.last_message.created_at,
            id: self.last_message.id,
        }
    }
}

/// Position in a user's chat list, ordered by latest message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomCursor {
    /// Creation time of the boundary room's latest message.
    pub created_at: Timestamp,
    /// ID of the boundary room's latest message.
    pub id: MessageId,
}

/// One page of a user's chat list, most recently active room first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomPage {
    /// Room summaries in descending latest-message order.
    pub rooms: Vec<ChatSummary>,
    /// Cursor to request the next page; `None` when `has_more` is false.
    pub next_cursor: Option<RoomCursor>,
    /// Whether more rooms exist beyond this page.
    pub has_more: bool,
}

/// Error returned when a message body fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message body is empty or whitespace only.
    #[error("message body is empty")]
    Empty,
    /// Message body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Checks that a message body is non-blank and at most `max` bytes.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank bodies and
/// [`ValidationError::TooLarge`] for oversized ones.
pub fn validate_body(body: &str, max: usize) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if body.len() > max {
        return Err(ValidationError::TooLarge {
            size: body.len(),
            max,
        });
    }
    Ok(())
}
