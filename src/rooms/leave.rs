use std::sync::Arc;

use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_sessions::Session;

use crate::{auth, broadcast::BroadcastEngine, AppResult};

use super::RoomName;

#[derive(Deserialize)]
pub(crate) struct LeaveRoomQuery {
    room_name: RoomName,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn leave_room(
    State(engine): State<Arc<BroadcastEngine>>,
    session: Session,

    Json(LeaveRoomQuery { room_name }): Json<LeaveRoomQuery>,
) -> AppResult<Json<Value>> {
    let user = auth::require_user(&session).await?;

    engine.leave(&room_name, &user).await?;
    Ok(Json(json!({ "status": "Left chat room successfully" })))
}
