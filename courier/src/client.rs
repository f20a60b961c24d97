//! WebSocket client for the Courier relay.
//!
//! [`RelayClient::connect`] opens the socket, registers the identity and
//! waits for both the registration ack and the notification backlog. After
//! that a background reader task routes responses back to the request that
//! is waiting for them and forwards pushes (`NewMessage`, `Notification`)
//! to the [`Session::events`] channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use courier_proto::codec::{self, CodecError};
use courier_proto::ids::{ConnectionId, NotificationId, Role, RoomKey, UserId};
use courier_proto::message::{ChatMessage, MessageCursor, MessagePage, RoomCursor, RoomPage};
use courier_proto::notification::Notification;
use courier_proto::relay::{ClientFrame, Outcome, RequestId, ServerFrame};

/// Write half of the WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Read half of the WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Requests waiting for their response, by correlation ID.
type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerFrame>>>>;

/// Timeout for establishing the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for `Registered` and the backlog that follows it.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single request/response round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`RelayClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting, registering or waiting for a response took too long.
    #[error("timed out")]
    Timeout,

    /// The relay could not be reached.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The relay refused the registration or reported a protocol error.
    #[error("rejected by relay: {0}")]
    Rejected(String),

    /// A request completed with a non-`Ok` outcome.
    #[error("request failed: {0:?}")]
    Request(Outcome),

    /// The relay answered with a frame that does not fit the request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Whether reconnecting might make this error go away.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Unreachable(_) | Self::ConnectionClosed
        )
    }

    /// Whether this is a `NotFound` outcome.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Request(Outcome::NotFound))
    }
}

/// Who this client registers as. Authentication happens elsewhere; the
/// relay trusts the ID it is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authenticated user.
    pub user_id: UserId,
    /// Name shown to the other participant.
    pub display_name: String,
    /// Client or vendor.
    pub role: Role,
}

impl Identity {
    /// Builds an identity.
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role,
        }
    }
}

/// Pushes and connection-level events from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A message was posted to a joined room by the other participant.
    NewMessage {
        /// The room.
        room: RoomKey,
        /// The persisted message.
        message: ChatMessage,
    },
    /// A notification was raised for this user.
    Notification(Notification),
    /// The relay reported a protocol error.
    Error(String),
    /// The connection closed. No further events follow.
    Disconnected,
}

/// A freshly registered connection.
#[derive(Debug)]
pub struct Session {
    /// Handle for issuing requests.
    pub client: RelayClient,
    /// Notifications pending at registration time, oldest first.
    pub backlog: Vec<Notification>,
    /// Live pushes, in arrival order.
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// A registered connection to the relay.
pub struct RelayClient {
    identity: Identity,
    connection: ConnectionId,
    ws_sender: Arc<tokio::sync::Mutex<WsSender>>,
    pending: PendingRequests,
    next_request: AtomicU64,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:9000/ws`) and registers.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if connecting or registration times out.
    /// - [`ClientError::Unreachable`] if the WebSocket handshake fails.
    /// - [`ClientError::Rejected`] if the relay answers with an error.
    /// - [`ClientError::ConnectionClosed`] if the relay hangs up first.
    pub async fn connect(url: &str, identity: Identity) -> Result<Session, ClientError> {
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "relay connect timed out");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, error = %e, "relay connect failed");
                ClientError::Unreachable(e.to_string())
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let register = ClientFrame::Register {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
        };
        write_frame(&mut ws_sender, &register).await?;

        let (connection, backlog) =
            tokio::time::timeout(REGISTER_TIMEOUT, await_registration(&mut ws_reader))
                .await
                .map_err(|_| {
                    tracing::warn!(url, "relay registration timed out");
                    ClientError::Timeout
                })??;
        tracing::info!(
            user_id = %identity.user_id,
            %connection,
            backlog = backlog.len(),
            "registered with relay"
        );

        let (tx, events) = mpsc::unbounded_channel();
        let pending: PendingRequests = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            tx,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        let client = Self {
            identity,
            connection,
            ws_sender: Arc::new(tokio::sync::Mutex::new(ws_sender)),
            pending,
            next_request: AtomicU64::new(1),
            connected,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reader_handle,
        };
        Ok(Session {
            client,
            backlog,
            events,
        })
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The registered identity.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Relay-side ID of this connection.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Whether the reader task still sees an open connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Allocates a correlation ID, e.g. to tag an optimistic echo before
    /// calling [`send_message`](Self::send_message).
    pub fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// The room shared with `peer`.
    #[must_use]
    pub fn room_with(&self, peer: &UserId) -> RoomKey {
        RoomKey::between(&self.identity.user_id, peer)
    }

    /// Starts receiving live messages for `room`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] with `NotFound` or `Rejected` if the room is
    /// unknown or not ours; transport errors otherwise.
    pub async fn join_room(&self, room: &RoomKey) -> Result<(), ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::JoinRoom {
            request_id,
            room: room.to_string(),
        };
        expect_ack(self.request(request_id, &frame).await?)
    }

    /// Stops receiving live messages for `room`.
    ///
    /// # Errors
    ///
    /// As for [`join_room`](Self::join_room).
    pub async fn leave_room(&self, room: &RoomKey) -> Result<(), ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::LeaveRoom {
            request_id,
            room: room.to_string(),
        };
        expect_ack(self.request(request_id, &frame).await?)
    }

    /// Sends a message and returns it as persisted by the relay.
    ///
    /// `request_id` should come from [`next_request_id`](Self::next_request_id).
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] if validation or storage fails on the relay.
    pub async fn send_message(
        &self,
        request_id: RequestId,
        room: &RoomKey,
        body: impl Into<String>,
    ) -> Result<ChatMessage, ClientError> {
        let frame = ClientFrame::SendMessage {
            request_id,
            room: room.to_string(),
            body: body.into(),
        };
        match self.request(request_id, &frame).await? {
            ServerFrame::Sent { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches one page of history, newest first.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] if the room is unknown or not ours.
    pub async fn fetch_history(
        &self,
        room: &RoomKey,
        cursor: Option<MessageCursor>,
        page_size: u32,
    ) -> Result<MessagePage, ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::FetchHistory {
            request_id,
            room: room.to_string(),
            cursor,
            page_size,
        };
        match self.request(request_id, &frame).await? {
            ServerFrame::History { page, .. } => Ok(page),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches one page of this user's chat list.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] if storage fails on the relay.
    pub async fn list_rooms(
        &self,
        cursor: Option<RoomCursor>,
        page_size: u32,
    ) -> Result<RoomPage, ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::ListRooms {
            request_id,
            cursor,
            page_size,
        };
        match self.request(request_id, &frame).await? {
            ServerFrame::Rooms { page, .. } => Ok(page),
            other => Err(unexpected(other)),
        }
    }

    /// Re-reads every pending notification.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] if storage fails on the relay.
    pub async fn fetch_pending(&self) -> Result<Vec<Notification>, ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::FetchPending { request_id };
        match self.request(request_id, &frame).await? {
            ServerFrame::PendingList { notifications, .. } => Ok(notifications),
            other => Err(unexpected(other)),
        }
    }

    /// Marks a notification read. Marking it twice is not an error.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] with `NotFound` for an unknown ID.
    pub async fn mark_read(&self, notification_id: NotificationId) -> Result<(), ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::MarkRead {
            request_id,
            notification_id,
        };
        expect_ack(self.request(request_id, &frame).await?)
    }

    /// Deletes a notification.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] with `NotFound` for an unknown ID.
    pub async fn delete_notification(
        &self,
        notification_id: NotificationId,
    ) -> Result<(), ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::DeleteNotification {
            request_id,
            notification_id,
        };
        expect_ack(self.request(request_id, &frame).await?)
    }

    /// Deletes every notification of this user.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] if storage fails on the relay.
    pub async fn clear_notifications(&self) -> Result<(), ClientError> {
        self.clear_notifications_for(&self.identity.user_id).await
    }

    /// Deletes every notification of `recipient`. The relay rejects any
    /// recipient other than the registered user.
    ///
    /// # Errors
    ///
    /// [`ClientError::Request`] with `Rejected` for another user's feed.
    pub async fn clear_notifications_for(&self, recipient: &UserId) -> Result<(), ClientError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::ClearNotifications {
            request_id,
            recipient: recipient.clone(),
        };
        expect_ack(self.request(request_id, &frame).await?)
    }

    /// Sends a close frame. The reader task ends once the relay answers.
    pub async fn close(&self) {
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(error = %e, "close frame not sent");
        }
    }

    /// Sends `frame` and waits for the response carrying `request_id`.
    async fn request(
        &self,
        request_id: RequestId,
        frame: &ClientFrame,
    ) -> Result<ServerFrame, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        // Checked after the insert: a reader that exits later drops `tx`,
        // one that already exited cleared the map before we got here.
        if !self.is_connected() {
            self.pending.lock().remove(&request_id);
            return Err(ClientError::ConnectionClosed);
        }

        let sent = {
            let mut sender = self.ws_sender.lock().await;
            write_frame(&mut *sender, frame).await
        };
        if let Err(e) = sent {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // Sender dropped: the reader task ended.
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("user_id", &self.identity.user_id)
            .field("connection", &self.connection)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn expect_ack(frame: ServerFrame) -> Result<(), ClientError> {
    match frame {
        ServerFrame::Ack {
            outcome: Outcome::Ok,
            ..
        } => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Turns a response of the wrong shape into an error. Failure acks become
/// [`ClientError::Request`].
fn unexpected(frame: ServerFrame) -> ClientError {
    match frame {
        ServerFrame::Ack { outcome, .. } => ClientError::Request(outcome),
        other => ClientError::UnexpectedResponse(format!("{other:?}")),
    }
}

async fn write_frame(
    sender: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &ClientFrame,
) -> Result<(), ClientError> {
    let bytes = codec::encode(frame)?;
    sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "relay write failed");
            ClientError::ConnectionClosed
        })
}

/// Reads frames until both `Registered` and `Pending` have arrived.
async fn await_registration(
    ws_reader: &mut WsReader,
) -> Result<(ConnectionId, Vec<Notification>), ClientError> {
    let mut connection = None;
    while let Some(msg) = ws_reader.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => return Err(ClientError::ConnectionClosed),
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket error during registration");
                return Err(ClientError::ConnectionClosed);
            }
        };
        match codec::decode::<ServerFrame>(&data)? {
            ServerFrame::Registered {
                connection: id, ..
            } => connection = Some(id),
            ServerFrame::Pending { notifications } => {
                return connection.map(|id| (id, notifications)).ok_or_else(|| {
                    ClientError::UnexpectedResponse("backlog before registration ack".into())
                });
            }
            ServerFrame::Error { reason } => {
                tracing::warn!(%reason, "relay registration rejected");
                return Err(ClientError::Rejected(reason));
            }
            other => {
                tracing::debug!(frame = ?other, "ignoring frame during registration");
            }
        }
    }
    Err(ClientError::ConnectionClosed)
}

/// Routes responses to waiting requests and pushes to `events`.
///
/// Malformed frames are logged and skipped.
async fn reader_loop(
    mut ws_reader: WsReader,
    events: mpsc::UnboundedSender<ClientEvent>,
    pending: PendingRequests,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = ws_reader.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => {
                tracing::info!("relay closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "relay read failed");
                break;
            }
        };
        let frame = match codec::decode::<ServerFrame>(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed relay frame, skipping");
                continue;
            }
        };

        if let Some(request_id) = frame.request_id() {
            let waiter = pending.lock().remove(&request_id);
            match waiter {
                Some(tx) => {
                    // The requester may have timed out in the meantime.
                    let _ = tx.send(frame);
                }
                None => tracing::debug!(request_id, "response for unknown request"),
            }
            continue;
        }

        let event = match frame {
            ServerFrame::NewMessage { room, message } => ClientEvent::NewMessage { room, message },
            ServerFrame::Notification { notification } => ClientEvent::Notification(notification),
            ServerFrame::Error { reason } => {
                tracing::warn!(%reason, "relay reported an error");
                ClientEvent::Error(reason)
            }
            other => {
                tracing::debug!(frame = ?other, "unexpected push");
                continue;
            }
        };
        if events.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    connected.store(false, Ordering::Relaxed);
    // Dropping the senders wakes every waiting request with `ConnectionClosed`.
    pending.lock().clear();
    let _ = events.send(ClientEvent::Disconnected);
    tracing::info!("relay reader task exiting");
}
