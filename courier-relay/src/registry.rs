//! Connection registry: which users are live and through which handle.
//!
//! A user has at most one current binding. Registering again supersedes the
//! previous binding without closing it; the old transport winds down on its
//! own and [`ConnectionRegistry::release`] makes sure its teardown cannot
//! unbind the replacement.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use courier_proto::ids::{ConnectionId, Role, UserId};
use courier_proto::notification::Notification;
use courier_proto::relay::ServerFrame;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::notifications::NotificationQueue;
use crate::store::{NotificationStore, StoreError};

/// What a connection's writer task is asked to do.
#[derive(Debug)]
pub enum Outbound {
    /// Encode and write a frame.
    Frame(ServerFrame),
    /// Send a WebSocket close frame and stop.
    Close,
}

/// Returned when the connection's writer task is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {0} is closed")]
pub struct HandleClosed(pub ConnectionId);

/// The relay's view of one live connection.
///
/// Cheap to clone; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct Handle {
    connection: ConnectionId,
    user: UserId,
    display_name: Arc<str>,
    role: Role,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Handle {
    /// Wraps the sending half of a connection's outbound channel.
    #[must_use]
    pub fn new(
        connection: ConnectionId,
        user: UserId,
        display_name: &str,
        role: Role,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            connection,
            user,
            display_name: Arc::from(display_name),
            role,
            tx,
        }
    }

    /// Relay-assigned connection ID.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The registered user.
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    /// Display name given at registration.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Role given at registration.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Queues a frame for the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`HandleClosed`] if the writer task has exited.
    pub fn send(&self, frame: ServerFrame) -> Result<(), HandleClosed> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| HandleClosed(self.connection))
    }

    /// Asks the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Whether the writer task has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Result of a successful [`ConnectionRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    /// The binding this registration replaced, if any.
    pub superseded: Option<Handle>,
    /// The backlog handed to the new connection, oldest first.
    pub pending: Vec<Notification>,
}

/// Map of user IDs to their current connection handle.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Handle>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a process-unique connection ID.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Binds `handle`'s user to it and hands it the notification backlog.
    ///
    /// Runs under the user's notification lane: the `Registered` and
    /// `Pending` frames are queued on the handle before any live
    /// notification push for this user can target it, so every notification
    /// is either in the backlog or pushed afterwards, exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backlog cannot be read. The previous
    /// binding is restored in that case if its connection is still open;
    /// otherwise the user is left unbound.
    pub async fn register<S: NotificationStore>(
        &self,
        handle: Handle,
        queue: &NotificationQueue<S>,
    ) -> Result<Registration, StoreError> {
        let user = handle.user().clone();
        let lane = queue.lock(&user).await;

        let superseded = self.connections.insert(user.clone(), handle.clone());

        let pending = match lane.drain_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                match superseded.filter(|old| !old.is_closed()) {
                    Some(old) => {
                        self.connections.insert(user, old);
                    }
                    None => self.release(&user, handle.connection()),
                }
                return Err(e);
            }
        };

        let delivered = handle
            .send(ServerFrame::Registered {
                user_id: user.clone(),
                connection: handle.connection(),
            })
            .and_then(|()| {
                handle.send(ServerFrame::Pending {
                    notifications: pending.clone(),
                })
            });
        if delivered.is_err() {
            tracing::warn!(user_id = %user, connection = %handle.connection(), "connection closed during registration");
            self.release(&user, handle.connection());
        }
        drop(lane);

        if let Some(old) = &superseded {
            tracing::info!(
                user_id = %user,
                old = %old.connection(),
                new = %handle.connection(),
                "superseded existing connection"
            );
        }

        Ok(Registration {
            superseded,
            pending,
        })
    }

    /// Removes `user`'s binding, whatever it points to. Idempotent.
    pub fn unregister(&self, user: &UserId) -> Option<Handle> {
        self.connections.remove(user).map(|(_, handle)| handle)
    }

    /// Removes `user`'s binding only if it is still `connection`.
    pub fn release(&self, user: &UserId, connection: ConnectionId) {
        self.connections
            .remove_if(user, |_, handle| handle.connection() == connection);
    }

    /// The current handle of `user`, if connected.
    #[must_use]
    pub fn lookup(&self, user: &UserId) -> Option<Handle> {
        self.connections.get(user).map(|h| h.clone())
    }

    /// Number of connected users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no user is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Asks every registered connection to close.
    pub fn close_all(&self) {
        for entry in &self.connections {
            tracing::info!(user_id = %entry.key(), "sending close frame to connection");
            entry.value().close();
        }
    }
}
