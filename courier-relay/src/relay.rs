//! Relay server core: shared state, WebSocket handler and request routing.
//!
//! Each WebSocket connection registers once, then runs a reader task that
//! decodes [`ClientFrame`]s and hands them to the [`Dispatcher`], and a
//! writer task that drains the connection's outbound channel and sends
//! keepalive pings. Both tasks end together and the connection is torn down
//! through [`Dispatcher::disconnect`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use courier_proto::codec;
use courier_proto::ids::{Role, UserId};
use courier_proto::relay::{ClientFrame, Outcome, RequestId, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::registry::{Handle, Outbound};
use crate::store::Storage;
use crate::store::memory::MemoryStore;

/// Default maximum size of one WebSocket message in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Transport settings applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How often the writer pings an otherwise quiet connection.
    pub ping_interval: Duration,
    /// How long the reader waits for any frame before giving up. Also
    /// bounds the wait for the initial `Register`.
    pub idle_timeout: Duration,
    /// Largest accepted WebSocket message.
    pub max_frame_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Shared relay server state.
pub struct RelayState<S> {
    /// Routing core.
    pub dispatcher: Dispatcher<S>,
    /// Per-connection transport settings.
    pub settings: ConnectionSettings,
}

impl Default for RelayState<MemoryStore> {
    fn default() -> Self {
        Self::new(Dispatcher::new(Arc::new(MemoryStore::new())))
    }
}

impl<S: Storage> RelayState<S> {
    /// Creates relay state with default connection settings.
    #[must_use]
    pub fn new(dispatcher: Dispatcher<S>) -> Self {
        Self::with_settings(dispatcher, ConnectionSettings::default())
    }

    /// Creates relay state with explicit connection settings.
    #[must_use]
    pub const fn with_settings(dispatcher: Dispatcher<S>, settings: ConnectionSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Asks every connected client to close. Used on shutdown.
    pub fn close_all_connections(&self) {
        self.dispatcher.registry().close_all();
    }
}

/// What the client asked to be registered as.
struct Registration {
    user_id: UserId,
    display_name: String,
    role: Role,
}

/// Handles an upgraded WebSocket connection for a single user.
///
/// The connection lifecycle:
/// 1. Wait for a `Register` frame (bounded by the idle timeout).
/// 2. Bind the user and queue `Registered` and `Pending` on the handle.
/// 3. Run the reader and writer tasks until either ends.
/// 4. Leave all rooms and release the binding.
pub async fn handle_socket<S: Storage>(socket: WebSocket, state: Arc<RelayState<S>>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let settings = state.settings;

    let registration =
        match tokio::time::timeout(settings.idle_timeout, wait_for_register(&mut ws_receiver))
            .await
        {
            Ok(Some(r)) => r,
            Ok(None) => {
                tracing::warn!("connection closed before registration");
                return;
            }
            Err(_) => {
                tracing::warn!("registration timed out");
                return;
            }
        };

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = Handle::new(
        state.dispatcher.registry().next_connection_id(),
        registration.user_id,
        &registration.display_name,
        registration.role,
        tx,
    );
    let user = handle.user().clone();
    let connection = handle.connection();

    if let Err(e) = state.dispatcher.connect(handle.clone()).await {
        tracing::error!(user_id = %user, error = %e, "registration failed");
        let frame = ServerFrame::Error {
            reason: format!("registration failed: {e}"),
        };
        if let Err(e) = send_frame(&mut ws_sender, &frame).await {
            tracing::debug!(user_id = %user, error = %e, "could not report registration failure");
        }
        return;
    }

    // Writer: forwards outbound frames and keeps the connection alive.
    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + settings.ping_interval;
        let mut ping = tokio::time::interval_at(start, settings.ping_interval);
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                            tracing::warn!(user_id = %writer_user, error = %e, "WebSocket write failed");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        tracing::debug!(user_id = %writer_user, "ping failed");
                        break;
                    }
                }
            }
        }
    });

    // Reader: any frame, pongs included, counts as liveness.
    let reader_state = Arc::clone(&state);
    let reader_handle = handle.clone();
    let mut read_task = tokio::spawn(async move {
        loop {
            let msg = match tokio::time::timeout(settings.idle_timeout, ws_receiver.next()).await {
                Err(_) => {
                    tracing::info!(user_id = %reader_handle.user(), "idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::warn!(user_id = %reader_handle.user(), error = %e, "WebSocket read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&reader_state.dispatcher, &reader_handle, &data).await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_handle.user(), "received close frame");
                    break;
                }
                _ => {
                    // Text, ping and pong frames only refresh the idle timer.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.dispatcher.disconnect(&user, connection);
}

/// Waits for the first binary frame, expecting `Register`.
///
/// Returns `None` if the connection closes or anything else arrives first.
async fn wait_for_register(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Registration> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match codec::decode::<ClientFrame>(&data) {
                Ok(ClientFrame::Register {
                    user_id,
                    display_name,
                    role,
                }) => {
                    return Some(Registration {
                        user_id,
                        display_name,
                        role,
                    });
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected Register, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode registration frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {
                // Skip non-binary frames (ping/pong) during registration.
            }
        }
    }
    None
}

/// Decodes one binary frame from a registered connection and answers it.
async fn handle_binary_message<S: Storage>(
    dispatcher: &Dispatcher<S>,
    handle: &Handle,
    data: &[u8],
) {
    let reply = match codec::decode::<ClientFrame>(data) {
        Ok(frame) => respond(dispatcher, handle, frame).await,
        Err(e) => {
            tracing::warn!(user_id = %handle.user(), error = %e, "failed to decode frame");
            Some(ServerFrame::Error {
                reason: format!("undecodable frame: {e}"),
            })
        }
    };
    if let Some(reply) = reply
        && handle.send(reply).is_err()
    {
        tracing::debug!(user_id = %handle.user(), "connection closed before reply");
    }
}

fn ack(request_id: RequestId, result: Result<(), DispatchError>) -> ServerFrame {
    let outcome = match result {
        Ok(()) => Outcome::Ok,
        Err(e) => {
            tracing::debug!(request_id, error = %e, "request failed");
            e.outcome()
        }
    };
    ServerFrame::Ack {
        request_id,
        outcome,
    }
}

/// Runs one client request. The registered handle is the only identity
/// considered; user IDs inside frames are never trusted for authorship.
async fn respond<S: Storage>(
    dispatcher: &Dispatcher<S>,
    handle: &Handle,
    frame: ClientFrame,
) -> Option<ServerFrame> {
    let user = handle.user();
    let reply = match frame {
        ClientFrame::Register { user_id, .. } => {
            tracing::warn!(user_id = %user, new_id = %user_id, "duplicate Register on registered connection");
            ServerFrame::Error {
                reason: "already registered".to_string(),
            }
        }
        ClientFrame::JoinRoom { request_id, room } => {
            ack(request_id, dispatcher.join(handle, &room).map(|_| ()))
        }
        ClientFrame::LeaveRoom { request_id, room } => {
            ack(request_id, dispatcher.leave(handle, &room).map(|_| ()))
        }
        ClientFrame::SendMessage {
            request_id,
            room,
            body,
        } => match dispatcher.send_message(handle, request_id, &room, body).await {
            // `Sent` has already been queued by the dispatcher.
            Ok(_) => return None,
            Err(e) => ack(request_id, Err(e)),
        },
        ClientFrame::FetchHistory {
            request_id,
            room,
            cursor,
            page_size,
        } => match dispatcher.history(user, &room, cursor, page_size).await {
            Ok(page) => ServerFrame::History { request_id, page },
            Err(e) => ack(request_id, Err(e)),
        },
        ClientFrame::ListRooms {
            request_id,
            cursor,
            page_size,
        } => match dispatcher.list_rooms(user, cursor, page_size).await {
            Ok(page) => ServerFrame::Rooms { request_id, page },
            Err(e) => ack(request_id, Err(e)),
        },
        ClientFrame::FetchPending { request_id } => match dispatcher.pending(user).await {
            Ok(notifications) => ServerFrame::PendingList {
                request_id,
                notifications,
            },
            Err(e) => ack(request_id, Err(e)),
        },
        ClientFrame::MarkRead {
            request_id,
            notification_id,
        } => ack(
            request_id,
            dispatcher.mark_read(user, notification_id).await.map(|_| ()),
        ),
        ClientFrame::DeleteNotification {
            request_id,
            notification_id,
        } => ack(
            request_id,
            dispatcher.delete_notification(user, notification_id).await,
        ),
        ClientFrame::ClearNotifications {
            request_id,
            recipient,
        } => ack(
            request_id,
            dispatcher
                .clear_notifications(user, &recipient)
                .await
                .map(|_| ()),
        ),
    };
    Some(reply)
}

/// Encodes and sends a server frame directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let bytes = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Builds the HTTP router: `GET /ws` and `POST /api/notifications`.
pub fn router<S: Storage>(state: Arc<RelayState<S>>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S>))
        .route(
            "/api/notifications",
            axum::routing::post(crate::api::raise_notification::<S>),
        )
        .with_state(state)
}

/// Starts the relay server with in-memory storage and default settings,
/// returning the bound address and a join handle.
///
/// This is the primary entry point used by test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::default())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state<S: Storage>(
    addr: &str,
    state: Arc<RelayState<S>>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler<S: Storage>(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState<S>>>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(state.settings.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}
