//! Relay wire protocol frames.
//!
//! Clients send [`ClientFrame`]s and the relay answers with
//! [`ServerFrame`]s, postcard-encoded in WebSocket binary frames (see
//! [`crate::codec`]). Requests that expect an answer carry a client-chosen
//! `request_id` which the relay echoes back; pushes (`NewMessage`,
//! `Notification`) carry none.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, NotificationId, Role, RoomKey, UserId};
use crate::message::{ChatMessage, MessageCursor, MessagePage, RoomCursor, RoomPage};
use crate::notification::Notification;

/// Client-chosen correlation ID for request/response pairs.
pub type RequestId = u64;

/// Frames sent from a client to the relay.
///
/// Room keys travel as strings so that a garbage key can be answered with
/// [`Outcome::NotFound`] instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Binds this connection to a user. Must be the first frame.
    ///
    /// The relay answers with [`ServerFrame::Registered`] followed by
    /// [`ServerFrame::Pending`].
    Register {
        /// The already-authenticated user.
        user_id: UserId,
        /// Name shown to the other participant in notifications.
        display_name: String,
        /// Client or vendor.
        role: Role,
    },

    /// Start receiving live messages for a room.
    JoinRoom {
        /// Correlation ID.
        request_id: RequestId,
        /// Canonical room key.
        room: String,
    },

    /// Stop receiving live messages for a room.
    LeaveRoom {
        /// Correlation ID.
        request_id: RequestId,
        /// Canonical room key.
        room: String,
    },

    /// Send a chat message to a room.
    ///
    /// Answered with [`ServerFrame::Sent`] on success, or an
    /// [`ServerFrame::Ack`] carrying the failure.
    SendMessage {
        /// Correlation ID; also identifies the optimistic local echo.
        request_id: RequestId,
        /// Canonical room key.
        room: String,
        /// Message text.
        body: String,
    },

    /// Request one page of room history.
    FetchHistory {
        /// Correlation ID.
        request_id: RequestId,
        /// Canonical room key.
        room: String,
        /// Exclusive upper bound; `None` for the newest page.
        cursor: Option<MessageCursor>,
        /// Requested page size (clamped by the relay).
        page_size: u32,
    },

    /// Request one page of the caller's chat list.
    ListRooms {
        /// Correlation ID.
        request_id: RequestId,
        /// Exclusive upper bound; `None` for the first page.
        cursor: Option<RoomCursor>,
        /// Requested page size (clamped by the relay).
        page_size: u32,
    },

    /// Re-read all pending notifications.
    FetchPending {
        /// Correlation ID.
        request_id: RequestId,
    },

    /// Mark one notification as read.
    MarkRead {
        /// Correlation ID.
        request_id: RequestId,
        /// Target notification.
        notification_id: NotificationId,
    },

    /// Delete one notification.
    DeleteNotification {
        /// Correlation ID.
        request_id: RequestId,
        /// Target notification.
        notification_id: NotificationId,
    },

    /// Delete every notification of a recipient.
    ClearNotifications {
        /// Correlation ID.
        request_id: RequestId,
        /// Must be the registered user.
        recipient: UserId,
    },
}

/// Result of a request that has no richer response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The operation succeeded (or was an idempotent no-op).
    Ok,
    /// The room key or notification ID does not exist for this user.
    NotFound,
    /// The request was understood but not allowed.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// The relay could not complete the operation (e.g. storage failure).
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

impl Outcome {
    /// Whether the outcome is [`Outcome::Ok`].
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Registration succeeded.
    Registered {
        /// The registered user, echoed back.
        user_id: UserId,
        /// Relay-side ID of this connection.
        connection: ConnectionId,
    },

    /// The notification backlog at registration time, oldest first.
    Pending {
        /// All pending notifications.
        notifications: Vec<Notification>,
    },

    /// Live push: a message was posted to a room this connection joined.
    NewMessage {
        /// The room.
        room: RoomKey,
        /// The persisted message.
        message: ChatMessage,
    },

    /// Live push: a notification was raised for this user.
    Notification {
        /// The notification.
        notification: Notification,
    },

    /// The sender's own message, as persisted.
    Sent {
        /// Correlation ID of the `SendMessage`.
        request_id: RequestId,
        /// The persisted message.
        message: ChatMessage,
    },

    /// Response to `FetchHistory`.
    History {
        /// Correlation ID.
        request_id: RequestId,
        /// The page.
        page: MessagePage,
    },

    /// Response to `ListRooms`.
    Rooms {
        /// Correlation ID.
        request_id: RequestId,
        /// The page.
        page: RoomPage,
    },

    /// Response to `FetchPending`.
    PendingList {
        /// Correlation ID.
        request_id: RequestId,
        /// All pending notifications, oldest first.
        notifications: Vec<Notification>,
    },

    /// Generic acknowledgment for requests without a payload, and for
    /// failures of requests that have one.
    Ack {
        /// Correlation ID.
        request_id: RequestId,
        /// What happened.
        outcome: Outcome,
    },

    /// Protocol violation that cannot be tied to a request.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

impl ServerFrame {
    /// The correlation ID if this frame answers a request.
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Sent { request_id, .. }
            | Self::History { request_id, .. }
            | Self::Rooms { request_id, .. }
            | Self::PendingList { request_id, .. }
            | Self::Ack { request_id, .. } => Some(*request_id),
            Self::Registered { .. }
            | Self::Pending { .. }
            | Self::NewMessage { .. }
            | Self::Notification { .. }
            | Self::Error { .. } => None,
        }
    }
}
