//! HTTP API for other parts of the platform.
//!
//! `POST /api/notifications` raises a system notification (booking updates,
//! payment reminders and the like) for one user. It is stored and, if the
//! user is connected, pushed live exactly like a chat-message notification.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_proto::ids::{Role, RoomKey, UserId};
use courier_proto::message::validate_body;
use courier_proto::notification::{Notification, SenderRef};
use serde::Deserialize;

use crate::dispatcher::DispatchError;
use crate::relay::RelayState;
use crate::store::Storage;

/// Request body of `POST /api/notifications`.
#[derive(Debug, Clone, Deserialize)]
pub struct RaiseNotification {
    /// Who the notification is for.
    pub recipient: String,
    /// The recipient's role.
    pub recipient_role: Role,
    /// Who caused it.
    pub sender_id: String,
    /// Display name of the sender.
    pub sender_name: String,
    /// Notification text.
    pub body: String,
    /// Chat room to link to, if any.
    #[serde(default)]
    pub room: Option<String>,
}

/// Error response with a JSON `{ "error": ... }` body.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(reason: impl ToString) -> Self {
        Self(StatusCode::BAD_REQUEST, reason.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Store(_) => Self(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            other => Self::bad_request(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.1 });
        (self.0, Json(body)).into_response()
    }
}

impl RaiseNotification {
    fn into_notification(self, max_body_bytes: usize) -> Result<Notification, ApiError> {
        let recipient = UserId::parse(self.recipient).map_err(ApiError::bad_request)?;
        let sender = UserId::parse(self.sender_id).map_err(ApiError::bad_request)?;
        validate_body(&self.body, max_body_bytes).map_err(ApiError::bad_request)?;
        let room = self
            .room
            .as_deref()
            .map(RoomKey::parse)
            .transpose()
            .map_err(ApiError::bad_request)?;
        if room.as_ref().is_some_and(|r| !r.includes(&recipient)) {
            return Err(ApiError::bad_request("recipient is not a participant of room"));
        }

        Ok(Notification::new(
            recipient,
            self.recipient_role,
            SenderRef {
                id: sender,
                display_name: self.sender_name,
            },
            self.body,
            room,
        ))
    }
}

/// `POST /api/notifications`: stores a notification and pushes it if the
/// recipient is online. Answers `201` with the stored notification.
///
/// # Errors
///
/// `400` for invalid IDs or body, `503` if storage fails.
pub async fn raise_notification<S: Storage>(
    State(state): State<Arc<RelayState<S>>>,
    Json(request): Json<RaiseNotification>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let dispatcher = &state.dispatcher;
    let notification = request.into_notification(dispatcher.limits().max_body_bytes)?;
    let stored = dispatcher.notify(notification).await?;
    tracing::info!(
        recipient = %stored.recipient,
        notification_id = %stored.id,
        "system notification raised"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}
