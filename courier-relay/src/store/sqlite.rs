//! SQLite storage backend.
//!
//! Persists messages and notifications through an `sqlx` pool. The schema
//! is created on connect if missing; there are no migrations beyond that.

use std::str::FromStr;

use courier_proto::ids::{MessageId, NotificationId, Role, RoomKey, Timestamp, UserId};
use courier_proto::message::{ChatMessage, ChatSummary, MessageCursor, MessagePage, RoomCursor, RoomPage};
use courier_proto::notification::{Notification, ReadOutcome, SenderRef};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use super::{MessageDraft, MessageGateway, NotificationStore, StoreError, message_page, room_page};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room TEXT NOT NULL,
        room_low TEXT NOT NULL,
        room_high TEXT NOT NULL,
        sender TEXT NOT NULL,
        sender_role TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_low ON messages (room_low)",
    "CREATE INDEX IF NOT EXISTS idx_messages_high ON messages (room_high)",
    r"
    CREATE TABLE IF NOT EXISTS notifications (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        recipient TEXT NOT NULL,
        recipient_role TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        sender_name TEXT NOT NULL,
        body TEXT NOT NULL,
        read INTEGER NOT NULL DEFAULT 0,
        room TEXT,
        created_at INTEGER NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications (recipient, seq)",
];

/// Message and notification store backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url`, e.g.
    /// `sqlite://courier.db`, and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be opened
    /// or the schema cannot be created.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid sqlite url {url}: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::with_pool(pool).await
    }

    /// Opens a private in-memory database. Mostly useful for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if `SQLite` cannot be initialized.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Unavailable(format!("schema setup failed: {e}")))?;
        }

        tracing::debug!("sqlite store ready");
        Ok(Self { pool })
    }

    /// Closes the pool. Every later operation fails with
    /// [`StoreError::Unavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl MessageGateway for SqliteStore {
    async fn append_message(&self, draft: MessageDraft) -> Result<ChatMessage, StoreError> {
        let (low, high) = draft.room.participants();

        // The stamp is taken inside the INSERT so it is ordered with the
        // rowid by SQLite's single writer, never below any stored message.
        let row = sqlx::query(
            r"
            INSERT INTO messages (room, room_low, room_high, sender, sender_role, body, created_at)
            VALUES (?, ?, ?, ?, ?, ?,
                MAX(?, COALESCE((SELECT MAX(created_at) FROM messages), 0)))
            RETURNING id, created_at
            ",
        )
        .bind(draft.room.to_string())
        .bind(low.as_str())
        .bind(high.as_str())
        .bind(draft.sender.as_str())
        .bind(draft.sender_role.as_str())
        .bind(&draft.body)
        .bind(to_sql(Timestamp::now().as_millis()))
        .fetch_one(&self.pool)
        .await
        .map_err(write_failed)?;

        let id = from_sql(column(&row, "id")?, "id")?;
        let stamp = from_sql(column(&row, "created_at")?, "created_at")?;

        Ok(ChatMessage {
            id: MessageId::new(id),
            room: draft.room,
            sender: draft.sender,
            sender_role: draft.sender_role,
            body: draft.body,
            created_at: Timestamp::from_millis(stamp),
        })
    }

    async fn page_messages(
        &self,
        room: &RoomKey,
        cursor: Option<MessageCursor>,
        limit: usize,
    ) -> Result<MessagePage, StoreError> {
        let limit = limit.max(1);
        let (before_at, before_id) = cursor.map_or((i64::MAX, i64::MAX), |c| {
            (to_sql(c.created_at.as_millis()), to_sql(c.id.get()))
        });

        let rows = sqlx::query(
            r"
            SELECT id, room, sender, sender_role, body, created_at
            FROM messages
            WHERE room = ? AND (created_at < ? OR (created_at = ? AND id < ?))
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            ",
        )
        .bind(room.to_string())
        .bind(before_at)
        .bind(before_at)
        .bind(before_id)
        .bind(to_sql(limit as u64 + 1))
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(message_page(messages, limit))
    }

    async fn list_rooms_for_user(
        &self,
        user: &UserId,
        cursor: Option<RoomCursor>,
        limit: usize,
    ) -> Result<RoomPage, StoreError> {
        let limit = limit.max(1);
        let (before_at, before_id) = cursor.map_or((i64::MAX, i64::MAX), |c| {
            (to_sql(c.created_at.as_millis()), to_sql(c.id.get()))
        });

        let rows = sqlx::query(
            r"
            SELECT m.id, m.room, m.sender, m.sender_role, m.body, m.created_at
            FROM messages m
            JOIN (
                SELECT MAX(id) AS last_id
                FROM messages
                WHERE room_low = ? OR room_high = ?
                GROUP BY room
            ) latest ON m.id = latest.last_id
            WHERE m.created_at < ? OR (m.created_at = ? AND m.id < ?)
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT ?
            ",
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(before_at)
        .bind(before_at)
        .bind(before_id)
        .bind(to_sql(limit as u64 + 1))
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let last_message = message_from_row(row)?;
            let peer = last_message
                .room
                .other(user)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("{user} not in {}", last_message.room)))?;
            summaries.push(ChatSummary {
                room: last_message.room.clone(),
                peer,
                last_message,
            });
        }
        Ok(room_page(summaries, limit))
    }
}

impl NotificationStore for SqliteStore {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO notifications
                (id, recipient, recipient_role, sender_id, sender_name, body, read, room, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(notification.id.to_string())
        .bind(notification.recipient.as_str())
        .bind(notification.recipient_role.as_str())
        .bind(notification.sender.id.as_str())
        .bind(&notification.sender.display_name)
        .bind(&notification.body)
        .bind(i32::from(notification.read))
        .bind(notification.room.as_ref().map(ToString::to_string))
        .bind(to_sql(notification.created_at.as_millis()))
        .execute(&self.pool)
        .await
        .map_err(write_failed)?;
        Ok(())
    }

    async fn pending(&self, recipient: &UserId) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, recipient, recipient_role, sender_id, sender_name, body, read, room, created_at
            FROM notifications
            WHERE recipient = ?
            ORDER BY seq ASC
            ",
        )
        .bind(recipient.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;

        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_read(
        &self,
        recipient: &UserId,
        id: NotificationId,
    ) -> Result<Option<ReadOutcome>, StoreError> {
        let read: Option<i32> =
            sqlx::query_scalar("SELECT read FROM notifications WHERE id = ? AND recipient = ?")
                .bind(id.to_string())
                .bind(recipient.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(read_failed)?;

        match read {
            None => Ok(None),
            Some(flag) if flag != 0 => Ok(Some(ReadOutcome::AlreadyRead)),
            Some(_) => {
                sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND recipient = ?")
                    .bind(id.to_string())
                    .bind(recipient.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(write_failed)?;
                Ok(Some(ReadOutcome::Marked))
            }
        }
    }

    async fn delete(&self, recipient: &UserId, id: NotificationId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ? AND recipient = ?")
            .bind(id.to_string())
            .bind(recipient.as_str())
            .execute(&self.pool)
            .await
            .map_err(write_failed)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, recipient: &UserId) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE recipient = ?")
            .bind(recipient.as_str())
            .execute(&self.pool)
            .await
            .map_err(write_failed)?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn is_unavailable(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)
    )
}

fn write_failed(e: sqlx::Error) -> StoreError {
    if is_unavailable(&e) {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::WriteFailed(e.to_string())
    }
}

fn read_failed(e: sqlx::Error) -> StoreError {
    if is_unavailable(&e) {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::ReadFailed(e.to_string())
    }
}

fn column<T>(row: &SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {name}: {e}")))
}

fn user_column(row: &SqliteRow, name: &str) -> Result<UserId, StoreError> {
    let raw: String = column(row, name)?;
    UserId::parse(raw).map_err(|e| StoreError::Corrupt(format!("{name}: {e}")))
}

fn role_column(row: &SqliteRow, name: &str) -> Result<Role, StoreError> {
    let raw: String = column(row, name)?;
    Role::from_name(&raw).ok_or_else(|| StoreError::Corrupt(format!("{name}: unknown role {raw}")))
}

fn room_key(raw: &str) -> Result<RoomKey, StoreError> {
    RoomKey::parse(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage, StoreError> {
    let room: String = column(row, "room")?;
    Ok(ChatMessage {
        id: MessageId::new(from_sql(column(row, "id")?, "id")?),
        room: room_key(&room)?,
        sender: user_column(row, "sender")?,
        sender_role: role_column(row, "sender_role")?,
        body: column(row, "body")?,
        created_at: Timestamp::from_millis(from_sql(column(row, "created_at")?, "created_at")?),
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification, StoreError> {
    let id: String = column(row, "id")?;
    let id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id: {e}")))?;
    let room: Option<String> = column(row, "room")?;
    let read: i32 = column(row, "read")?;

    Ok(Notification {
        id: NotificationId::from_uuid(id),
        recipient: user_column(row, "recipient")?,
        recipient_role: role_column(row, "recipient_role")?,
        sender: SenderRef {
            id: user_column(row, "sender_id")?,
            display_name: column(row, "sender_name")?,
        },
        body: column(row, "body")?,
        read: read != 0,
        room: room.as_deref().map(room_key).transpose()?,
        created_at: Timestamp::from_millis(from_sql(column(row, "created_at")?, "created_at")?),
    })
}
