use std::sync::Arc;

use axum::{debug_handler, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tower_sessions::Session;

use crate::{auth, broadcast::BroadcastEngine, store::RoomStore, AppResult};

use super::RoomName;

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomQuery {
    name: RoomName,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn new_room(
    State(engine): State<Arc<BroadcastEngine>>,
    session: Session,

    Json(NewRoomQuery { name }): Json<NewRoomQuery>,
) -> AppResult<impl IntoResponse> {
    let user = auth::require_user(&session).await?;

    engine.store().create_room(&name).await?;
    engine.store().add_member(&name, &user).await?;
    tracing::info!(room = %name, user, "room created");

    Ok((StatusCode::CREATED, Json(json!({ "name": name }))))
}
