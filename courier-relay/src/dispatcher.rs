//! Delivery dispatcher: the one place that decides push versus queue.
//!
//! Every client request ends up here after the transport has decoded it.
//! Chat messages are persisted before anyone sees them, then broadcast to
//! the room's joined members; a participant the broadcast missed gets a
//! notification instead. Notifications are always stored and additionally
//! pushed when their recipient is connected.

use std::sync::Arc;

use courier_proto::ids::{ConnectionId, NotificationId, RoomKey, UserId};
use courier_proto::message::{
    ChatMessage, DEFAULT_MAX_BODY_BYTES, MessageCursor, MessagePage, RoomCursor, RoomPage,
    ValidationError, validate_body,
};
use courier_proto::notification::{Notification, ReadOutcome, SenderRef};
use courier_proto::relay::{Outcome, RequestId, ServerFrame};

use crate::lanes::KeyedLocks;
use crate::notifications::NotificationQueue;
use crate::registry::{ConnectionRegistry, Handle, Registration};
use crate::rooms::RoomRouter;
use crate::store::{MessageDraft, Storage, StoreError};

/// Longest notification preview of a chat message, in characters.
const PREVIEW_CHARS: usize = 140;

/// Size limits applied to client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted message body in bytes.
    pub max_body_bytes: usize,
    /// Page size used when a request asks for `0`.
    pub default_page_size: u32,
    /// Upper bound for any requested page size.
    pub max_page_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            default_page_size: 50,
            max_page_size: 100,
        }
    }
}

impl Limits {
    /// Maps a requested page size into `[1, max_page_size]`; `0` means the
    /// default.
    #[must_use]
    pub fn clamp_page(&self, requested: u32) -> usize {
        let size = if requested == 0 {
            self.default_page_size
        } else {
            requested
        };
        size.clamp(1, self.max_page_size.max(1)) as usize
    }
}

/// Why a request could not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The room key does not parse.
    #[error("unknown room: {0}")]
    RoomNotFound(String),

    /// The user is not one of the room's two participants.
    #[error("{user} is not a participant of {room}")]
    NotParticipant {
        /// The requesting user.
        user: UserId,
        /// The room they asked for.
        room: RoomKey,
    },

    /// No such notification for this recipient.
    #[error("notification not found")]
    NotificationNotFound,

    /// The message body was rejected.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ValidationError),

    /// The request targets another user's data.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// The protocol outcome reported to the client for this error.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::RoomNotFound(_) | Self::NotificationNotFound => Outcome::NotFound,
            Self::NotParticipant { .. } | Self::InvalidMessage(_) | Self::Forbidden(_) => {
                Outcome::Rejected {
                    reason: self.to_string(),
                }
            }
            Self::Store(_) => Outcome::Failed {
                reason: self.to_string(),
            },
        }
    }
}

/// Routes chat messages and notifications between connections and storage.
pub struct Dispatcher<S> {
    store: Arc<S>,
    registry: ConnectionRegistry,
    rooms: RoomRouter,
    queue: NotificationQueue<S>,
    send_lanes: KeyedLocks<RoomKey>,
    limits: Limits,
}

impl<S: Storage> Dispatcher<S> {
    /// Creates a dispatcher over `store` with default limits.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self::with_limits(store, Limits::default())
    }

    /// Creates a dispatcher over `store` with the given limits.
    #[must_use]
    pub fn with_limits(store: Arc<S>, limits: Limits) -> Self {
        Self {
            queue: NotificationQueue::new(Arc::clone(&store)),
            store,
            registry: ConnectionRegistry::new(),
            rooms: RoomRouter::new(),
            send_lanes: KeyedLocks::new(),
            limits,
        }
    }

    /// The connection registry.
    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The room router.
    pub const fn rooms(&self) -> &RoomRouter {
        &self.rooms
    }

    /// The notification queue.
    pub const fn queue(&self) -> &NotificationQueue<S> {
        &self.queue
    }

    /// Limits in force.
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Registers a fresh connection and queues its backlog on it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the backlog cannot be read; the
    /// connection is not registered then.
    pub async fn connect(&self, handle: Handle) -> Result<Registration, DispatchError> {
        let user = handle.user().clone();
        let connection = handle.connection();
        let registration = self.registry.register(handle, &self.queue).await?;
        if let Some(old) = registration
            .superseded
            .as_ref()
            .filter(|old| old.connection() != connection)
        {
            // Live room traffic follows the current connection only.
            let left = self.rooms.leave_all(old.connection());
            tracing::debug!(
                user_id = %user,
                connection = %old.connection(),
                rooms = left.len(),
                "superseded connection removed from its rooms"
            );
        }
        tracing::info!(
            user_id = %user,
            connection = %connection,
            pending = registration.pending.len(),
            "connection registered"
        );
        Ok(registration)
    }

    /// Tears down a connection: leaves its rooms and releases its binding.
    pub fn disconnect(&self, user: &UserId, connection: ConnectionId) {
        let left = self.rooms.leave_all(connection);
        self.registry.release(user, connection);
        tracing::info!(
            user_id = %user,
            connection = %connection,
            rooms = left.len(),
            "connection torn down"
        );
    }

    /// Treats a handle whose writer is gone as disconnected.
    pub fn drop_handle(&self, handle: &Handle) {
        tracing::warn!(
            user_id = %handle.user(),
            connection = %handle.connection(),
            "write to connection failed, dropping it"
        );
        self.disconnect(handle.user(), handle.connection());
    }

    fn parse_room(room: &str) -> Result<RoomKey, DispatchError> {
        RoomKey::parse(room).map_err(|_| DispatchError::RoomNotFound(room.to_string()))
    }

    fn participant_room(user: &UserId, room: &str) -> Result<RoomKey, DispatchError> {
        let key = Self::parse_room(room)?;
        if !key.includes(user) {
            return Err(DispatchError::NotParticipant {
                user: user.clone(),
                room: key,
            });
        }
        Ok(key)
    }

    /// Starts live delivery of `room` to `handle`. Nothing is replayed;
    /// history is fetched separately.
    ///
    /// # Errors
    ///
    /// [`DispatchError::RoomNotFound`] for a malformed key,
    /// [`DispatchError::NotParticipant`] for someone else's room,
    /// [`DispatchError::Forbidden`] when `handle` has been superseded by a
    /// newer registration of the same user.
    pub fn join(&self, handle: &Handle, room: &str) -> Result<RoomKey, DispatchError> {
        let key = Self::participant_room(handle.user(), room)?;
        self.ensure_current(handle)?;
        if self.rooms.join(handle, key.clone()) {
            tracing::debug!(user_id = %handle.user(), room = %key, "joined room");
        }
        // A registration that landed after the check above has already run
        // its `leave_all`, or will run it after this join.
        if let Err(e) = self.ensure_current(handle) {
            self.rooms.leave(handle.connection(), &key);
            return Err(e);
        }
        Ok(key)
    }

    fn ensure_current(&self, handle: &Handle) -> Result<(), DispatchError> {
        let current = self
            .registry
            .lookup(handle.user())
            .is_some_and(|h| h.connection() == handle.connection());
        if current {
            Ok(())
        } else {
            Err(DispatchError::Forbidden(format!(
                "connection {} is no longer the active one for {}",
                handle.connection(),
                handle.user()
            )))
        }
    }

    /// Stops live delivery of `room` to `handle`. Leaving a room that was
    /// never joined is not an error.
    ///
    /// # Errors
    ///
    /// [`DispatchError::RoomNotFound`] for a malformed key.
    pub fn leave(&self, handle: &Handle, room: &str) -> Result<RoomKey, DispatchError> {
        let key = Self::parse_room(room)?;
        if self.rooms.leave(handle.connection(), &key) {
            tracing::debug!(user_id = %handle.user(), room = %key, "left room");
        }
        Ok(key)
    }

    /// Persists and delivers a chat message from `sender`.
    ///
    /// On success the sender's connection has been sent
    /// [`ServerFrame::Sent`] and every other joined member a
    /// [`ServerFrame::NewMessage`]. If the other participant's current
    /// connection was not among them, a notification is raised for them.
    ///
    /// # Errors
    ///
    /// Validation errors, and [`DispatchError::Store`] if the message could
    /// not be persisted. Nothing is delivered in either case.
    pub async fn send_message(
        &self,
        sender: &Handle,
        request_id: RequestId,
        room: &str,
        body: String,
    ) -> Result<ChatMessage, DispatchError> {
        let key = Self::participant_room(sender.user(), room)?;
        validate_body(&body, self.limits.max_body_bytes)?;

        let lane = self.send_lanes.lock(&key).await;
        let message = self
            .store
            .append_message(MessageDraft {
                room: key.clone(),
                sender: sender.user().clone(),
                sender_role: sender.role(),
                body,
            })
            .await?;

        let report = self.rooms.broadcast(
            &key,
            &ServerFrame::NewMessage {
                room: key.clone(),
                message: message.clone(),
            },
            Some(sender.connection()),
        );
        drop(lane);

        for failed in &report.failed {
            self.drop_handle(failed);
        }

        tracing::debug!(
            room = %key,
            message_id = %message.id,
            reached = report.reached.len(),
            "message delivered"
        );

        if let Some(recipient) = key.other(sender.user()).filter(|r| *r != sender.user())
            && !self
                .registry
                .lookup(recipient)
                .is_some_and(|h| report.reached.contains(&h.connection()))
        {
            let notification = Notification::new(
                recipient.clone(),
                sender.role().counterpart(),
                SenderRef {
                    id: sender.user().clone(),
                    display_name: sender.display_name().to_string(),
                },
                preview(&message.body),
                Some(key.clone()),
            );
            if let Err(e) = self.notify(notification).await {
                tracing::warn!(
                    room = %key,
                    recipient = %recipient,
                    error = %e,
                    "message stored but notification failed"
                );
            }
        }

        // Last, so a sender holding `Sent` knows every notification is stored.
        if sender
            .send(ServerFrame::Sent {
                request_id,
                message: message.clone(),
            })
            .is_err()
        {
            tracing::debug!(user_id = %sender.user(), "sender went away before Sent");
        }

        Ok(message)
    }

    /// One page of `room`'s history, newest first.
    ///
    /// # Errors
    ///
    /// Room errors as for [`Self::join`], or [`DispatchError::Store`].
    pub async fn history(
        &self,
        requester: &UserId,
        room: &str,
        cursor: Option<MessageCursor>,
        page_size: u32,
    ) -> Result<MessagePage, DispatchError> {
        let key = Self::participant_room(requester, room)?;
        let limit = self.limits.clamp_page(page_size);
        Ok(self.store.page_messages(&key, cursor, limit).await?)
    }

    /// One page of `user`'s chat list, most recently active first.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Store`] on storage failure.
    pub async fn list_rooms(
        &self,
        user: &UserId,
        cursor: Option<RoomCursor>,
        page_size: u32,
    ) -> Result<RoomPage, DispatchError> {
        let limit = self.limits.clamp_page(page_size);
        Ok(self.store.list_rooms_for_user(user, cursor, limit).await?)
    }

    /// Stores `notification` and pushes it to its recipient if connected.
    ///
    /// The push happens under the recipient's lane, so it cannot race a
    /// registration of the same user.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Store`] if the notification could not be stored; it
    /// is not pushed then.
    pub async fn notify(&self, notification: Notification) -> Result<Notification, DispatchError> {
        let lane = self.queue.lock(&notification.recipient).await;
        lane.enqueue(&notification).await?;

        if let Some(handle) = self.registry.lookup(&notification.recipient) {
            let frame = ServerFrame::Notification {
                notification: notification.clone(),
            };
            if handle.send(frame).is_err() {
                self.drop_handle(&handle);
            } else {
                tracing::debug!(
                    recipient = %notification.recipient,
                    notification_id = %notification.id,
                    "notification pushed"
                );
            }
        }
        drop(lane);

        Ok(notification)
    }

    /// All pending notifications of `user`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Store`] on storage failure.
    pub async fn pending(&self, user: &UserId) -> Result<Vec<Notification>, DispatchError> {
        Ok(self.queue.drain_pending(user).await?)
    }

    /// Marks one of `user`'s notifications read.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotificationNotFound`] if `user` has no such
    /// notification, [`DispatchError::Store`] on storage failure.
    pub async fn mark_read(
        &self,
        user: &UserId,
        id: NotificationId,
    ) -> Result<ReadOutcome, DispatchError> {
        self.queue
            .mark_read(user, id)
            .await?
            .ok_or(DispatchError::NotificationNotFound)
    }

    /// Deletes one of `user`'s notifications.
    ///
    /// # Errors
    ///
    /// As for [`Self::mark_read`].
    pub async fn delete_notification(
        &self,
        user: &UserId,
        id: NotificationId,
    ) -> Result<(), DispatchError> {
        if self.queue.delete(user, id).await? {
            Ok(())
        } else {
            Err(DispatchError::NotificationNotFound)
        }
    }

    /// Deletes every notification of `recipient`, on behalf of `requester`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Forbidden`] unless `requester` is `recipient`,
    /// [`DispatchError::Store`] on storage failure.
    pub async fn clear_notifications(
        &self,
        requester: &UserId,
        recipient: &UserId,
    ) -> Result<usize, DispatchError> {
        if requester != recipient {
            return Err(DispatchError::Forbidden(format!(
                "{requester} cannot clear notifications of {recipient}"
            )));
        }
        let removed = self.queue.clear_all(recipient).await?;
        tracing::info!(recipient = %recipient, removed, "notifications cleared");
        Ok(removed)
    }

    /// Number of unread notifications of `user`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Store`] on storage failure.
    pub async fn unread_count(&self, user: &UserId) -> Result<usize, DispatchError> {
        Ok(self.queue.unread_count(user).await?)
    }
}

fn preview(body: &str) -> String {
    match body.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}
