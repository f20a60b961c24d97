//! Identifier types shared by the relay and its clients.
//!
//! The important one is [`RoomKey`]: both participants of a two-party chat
//! derive the same key from their IDs without asking the relay first.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between the two participant IDs inside a [`RoomKey`].
pub const ROOM_KEY_SEPARATOR: char = '|';

/// Maximum length of a [`UserId`] in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

/// Errors produced when parsing identifiers from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The user ID was empty.
    #[error("user id is empty")]
    EmptyUserId,
    /// The user ID exceeds [`MAX_USER_ID_LEN`].
    #[error("user id too long ({len} bytes, max {MAX_USER_ID_LEN})")]
    UserIdTooLong {
        /// Actual length in bytes.
        len: usize,
    },
    /// The user ID contains the room-key separator.
    #[error("user id must not contain '{ROOM_KEY_SEPARATOR}'")]
    ReservedCharacter,
    /// The room key is not of the form `low|high`.
    #[error("malformed room key: {0}")]
    MalformedRoomKey(String),
}

/// An authenticated user's identifier, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Validates and wraps a user identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the ID is empty, too long, or contains the
    /// room-key separator.
    pub fn parse(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::EmptyUserId);
        }
        if id.len() > MAX_USER_ID_LEN {
            return Err(IdError::UserIdTooLong { len: id.len() });
        }
        if id.contains(ROOM_KEY_SEPARATOR) {
            return Err(IdError::ReservedCharacter);
        }
        Ok(Self(id))
    }

    /// Returns the string form of this ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the marketplace a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A customer booking services.
    Client,
    /// A service provider.
    Vendor,
}

impl Role {
    /// The role on the other side of a client/vendor conversation.
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Client => Self::Vendor,
            Self::Vendor => Self::Client,
        }
    }

    /// Stable lowercase name, used for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Vendor => "vendor",
        }
    }

    /// Parses the lowercase name produced by [`Role::as_str`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "client" => Some(Self::Client),
            "vendor" => Some(Self::Vendor),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical key of a two-party chat room.
///
/// Built from the unordered pair of participants: the IDs are sorted and
/// joined with [`ROOM_KEY_SEPARATOR`], so `between(a, b) == between(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey {
    low: UserId,
    high: UserId,
}

impl RoomKey {
    /// Derives the room key for two participants, independent of order.
    #[must_use]
    pub fn between(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.clone(),
            high: high.clone(),
        }
    }

    /// Parses a key previously produced by `to_string()`.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::MalformedRoomKey`] if the string is not two valid,
    /// sorted user IDs separated by [`ROOM_KEY_SEPARATOR`].
    pub fn parse(key: &str) -> Result<Self, IdError> {
        let malformed = || IdError::MalformedRoomKey(key.to_string());
        let (low, high) = key.split_once(ROOM_KEY_SEPARATOR).ok_or_else(malformed)?;
        let low = UserId::parse(low).map_err(|_| malformed())?;
        let high = UserId::parse(high).map_err(|_| malformed())?;
        if low > high {
            return Err(malformed());
        }
        Ok(Self { low, high })
    }

    /// Both participants, lower ID first.
    #[must_use]
    pub const fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    /// Whether `user` is one of the two participants.
    #[must_use]
    pub fn includes(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`, or `None` if `user` is not in
    /// this room. For a self-chat the other participant is `user` itself.
    #[must_use]
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl TryFrom<String> for RoomKey {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ROOM_KEY_SEPARATOR}{}", self.low, self.high)
    }
}

/// Store-assigned identifier of a persisted chat message.
///
/// Strictly increasing in append order within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Wraps a raw store sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a notification, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NotificationId(Uuid);

impl NotificationId {
    /// Creates a new time-ordered notification identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `NotificationId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relay-assigned identifier of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw connection counter value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
