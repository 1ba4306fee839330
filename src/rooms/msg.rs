use std::sync::Arc;

use axum::{debug_handler, extract::{Query, State}, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::{auth, broadcast::BroadcastEngine, store::{ChatMessage, MessageId, MessageStore}, AppResult};

use super::RoomName;

/// Frame a client sends over the websocket.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub message: String,
    /// Ignored: the author is always the connection's user.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
}

/// Frames pushed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Chat { message: String, user: String },
    System { system: String },
    Error { error: String },
}

impl OutboundFrame {
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error { error: err.to_string() }
    }
}

impl From<&ChatMessage> for OutboundFrame {
    fn from(msg: &ChatMessage) -> Self {
        Self::Chat {
            message: msg.content.clone(),
            user: msg.user.clone(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ListMessagesQuery {
    room: RoomName,
    since: Option<MessageId>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list_messages(
    State(engine): State<Arc<BroadcastEngine>>,
    session: Session,
    Query(ListMessagesQuery { room, since }): Query<ListMessagesQuery>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    auth::require_user(&session).await?;

    let messages = engine.store().list(&room, since).await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
pub(crate) struct SendMessageQuery {
    room: RoomName,
    message: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn send_msg(
    State(engine): State<Arc<BroadcastEngine>>,
    session: Session,
    Json(SendMessageQuery { room, message }): Json<SendMessageQuery>,
) -> AppResult<impl IntoResponse> {
    let user = auth::require_user(&session).await?;

    let message = engine.submit(&room, &user, &message).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
