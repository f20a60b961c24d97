//! Per-recipient notification queue.
//!
//! Wraps a [`NotificationStore`] and runs every operation for one recipient
//! under that recipient's lane, so an enqueue never interleaves with a clear,
//! a drain or a live push for the same user. Callers that need several steps
//! to be atomic (registration binds a handle and drains in one go) take the
//! lane themselves via [`NotificationQueue::lock`].

use std::sync::Arc;

use courier_proto::ids::{NotificationId, UserId};
use courier_proto::notification::{Notification, ReadOutcome};

use crate::lanes::{KeyGuard, KeyedLocks};
use crate::store::{NotificationStore, StoreError};

/// Ordered, durable notification collections, one per recipient.
pub struct NotificationQueue<S> {
    store: Arc<S>,
    lanes: KeyedLocks<UserId>,
}

impl<S: NotificationStore> NotificationQueue<S> {
    /// Creates a queue over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lanes: KeyedLocks::new(),
        }
    }

    /// Takes exclusive access to `recipient`'s notifications.
    pub async fn lock(&self, recipient: &UserId) -> RecipientLane<'_, S> {
        RecipientLane {
            store: self.store.as_ref(),
            guard: self.lanes.lock(recipient).await,
        }
    }

    /// Appends a notification for its recipient.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store rejects the write.
    pub async fn enqueue(&self, notification: &Notification) -> Result<(), StoreError> {
        self.lock(&notification.recipient)
            .await
            .enqueue(notification)
            .await
    }

    /// All notifications of `recipient` not yet deleted, oldest first.
    ///
    /// Non-destructive: calling it twice returns the same list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn drain_pending(&self, recipient: &UserId) -> Result<Vec<Notification>, StoreError> {
        self.lock(recipient).await.drain_pending().await
    }

    /// Marks one notification read. `None` if `recipient` has no such
    /// notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn mark_read(
        &self,
        recipient: &UserId,
        id: NotificationId,
    ) -> Result<Option<ReadOutcome>, StoreError> {
        self.lock(recipient).await.mark_read(id).await
    }

    /// Hard-deletes one notification. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn delete(&self, recipient: &UserId, id: NotificationId) -> Result<bool, StoreError> {
        self.lock(recipient).await.delete(id).await
    }

    /// Hard-deletes every notification of `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn clear_all(&self, recipient: &UserId) -> Result<usize, StoreError> {
        self.lock(recipient).await.clear_all().await
    }

    /// Number of unread notifications of `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn unread_count(&self, recipient: &UserId) -> Result<usize, StoreError> {
        let pending = self.drain_pending(recipient).await?;
        Ok(pending.iter().filter(|n| !n.read).count())
    }
}

/// Exclusive access to one recipient's notifications.
///
/// Dropping it lets the next queued operation for that recipient run.
pub struct RecipientLane<'a, S> {
    store: &'a S,
    guard: KeyGuard<'a, UserId>,
}

impl<S: NotificationStore> RecipientLane<'_, S> {
    /// The recipient this lane belongs to.
    #[must_use]
    pub const fn recipient(&self) -> &UserId {
        self.guard.key()
    }

    /// Appends `notification`, which must be addressed to this recipient.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] for a notification addressed to
    /// someone else, or whatever the store reports.
    pub async fn enqueue(&self, notification: &Notification) -> Result<(), StoreError> {
        if &notification.recipient != self.recipient() {
            return Err(StoreError::WriteFailed(format!(
                "notification for {} enqueued on lane of {}",
                notification.recipient,
                self.recipient()
            )));
        }
        self.store.insert(notification).await?;
        tracing::debug!(
            recipient = %notification.recipient,
            notification_id = %notification.id,
            "notification enqueued"
        );
        Ok(())
    }

    /// See [`NotificationQueue::drain_pending`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn drain_pending(&self) -> Result<Vec<Notification>, StoreError> {
        self.store.pending(self.recipient()).await
    }

    /// See [`NotificationQueue::mark_read`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn mark_read(&self, id: NotificationId) -> Result<Option<ReadOutcome>, StoreError> {
        self.store.mark_read(self.recipient(), id).await
    }

    /// See [`NotificationQueue::delete`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn delete(&self, id: NotificationId) -> Result<bool, StoreError> {
        self.store.delete(self.recipient(), id).await
    }

    /// See [`NotificationQueue::clear_all`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn clear_all(&self) -> Result<usize, StoreError> {
        let removed = self.store.clear(self.recipient()).await?;
        tracing::debug!(recipient = %self.recipient(), removed, "notifications cleared");
        Ok(removed)
    }
}
