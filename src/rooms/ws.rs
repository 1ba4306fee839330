use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, Path, Query, State, WebSocketUpgrade},
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_sessions::Session;

use crate::{auth, broadcast::BroadcastEngine, config::Config, error::ChatError, AppResult};

use super::{
    connection::{ConnectionSession, Outbound},
    msg::{InboundFrame, OutboundFrame},
    ConnectionHandle, RoomEvent, RoomName,
};

#[derive(Deserialize)]
pub(crate) struct WsQuery {
    user: Option<String>,
}

/// Upgrades to a websocket joined to `room_name`.
///
/// The user comes from the login session. `?user=` is honoured only when
/// `allow_query_user` is configured. Bad room names are refused before the
/// upgrade.
#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    Path(room_name): Path<String>,
    Query(WsQuery { user }): Query<WsQuery>,
    State(engine): State<Arc<BroadcastEngine>>,
    State(config): State<Arc<Config>>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user = match auth::current_user(&session).await? {
        Some(user) => user,
        None if config.allow_query_user => {
            user.filter(|user| !user.trim().is_empty()).ok_or(ChatError::Unauthorized)?
        }
        None => return Err(ChatError::Unauthorized.into()),
    };
    let room = RoomName::parse(room_name)?;

    let (handle, events) = ConnectionHandle::new(user, config.outbound_buffer);
    let session = ConnectionSession::new(engine, handle);

    Ok(ws.on_upgrade(move |socket| run_connection(socket, session, events, room)))
}

async fn run_connection(
    socket: WebSocket,
    mut session: ConnectionSession,
    mut events: mpsc::Receiver<RoomEvent>,
    room: RoomName,
) {
    let (mut sender, mut receiver) = socket.split();

    if let Err(err) = session.connect(room.as_str()).await {
        tracing::warn!(%room, error = %err, "connection refused");
        let _ = send_frame(&mut sender, &OutboundFrame::error(&err)).await;
        let _ = sender.send(Message::Close(None)).await;
        session.disconnect().await;
        return;
    }

    let welcome = OutboundFrame::System { system: format!("connected to {room}") };
    if send_frame(&mut sender, &welcome).await.is_err() {
        session.disconnect().await;
        return;
    }

    let handle = session.handle().clone();
    loop {
        tokio::select! {
            _ = handle.evicted() => {
                tracing::debug!(%room, connection = %handle.id(), "evicted, closing");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            inbound = receiver.next() => {
                let payload = match inbound {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket receive failed");
                        break;
                    }
                };

                let reply = match serde_json::from_slice::<InboundFrame>(&payload) {
                    Ok(frame) => session.receive(frame).await.err().map(OutboundFrame::error),
                    Err(err) => Some(OutboundFrame::error(format!("malformed frame: {err}"))),
                };
                if let Some(reply) = reply {
                    if send_frame(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match session.on_event(event) {
                    Some(Outbound::Send(frame)) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => {}
                }
            }
        }
    }

    session.disconnect().await;
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &OutboundFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}
