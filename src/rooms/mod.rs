mod connection;
mod handle;
mod leave;
mod msg;
mod new;
mod registry;
mod relay;
mod room;
mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub use connection::{ConnectionSession, Outbound, SessionState};
pub use handle::{ConnectionHandle, ConnectionId, RoomEvent};
pub use msg::{InboundFrame, OutboundFrame};
pub use registry::RoomRegistry;
pub use room::{RoomName, MAX_ROOM_NAME_LEN};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/chat/{room_name}", get(ws::room_ws))
        .route("/api/chat/messages", get(msg::list_messages).post(msg::send_msg))
        .route("/api/rooms", post(new::new_room))
        .route("/leave_room/", post(leave::leave_room))
}

/// Ingress for peer instances. Only mounted when peers are configured.
pub fn relay_router() -> Router<AppState> {
    Router::new().route("/relay", post(relay::relay_ingress))
}
