//! Per-connection state machine: `Connecting -> Joined -> Closed`.
//!
//! The session owns its [`ConnectionHandle`] and is the only thing that adds
//! it to the registry. The engine may evict the handle (HTTP leave), after
//! which the session counts as `Closed`. `disconnect` is reachable from every
//! state and always runs `drop_all`.

use std::sync::Arc;

use crate::{broadcast::BroadcastEngine, error::{ChatError, ChatResult}, store::ChatMessage};

use super::{msg::{InboundFrame, OutboundFrame}, ConnectionHandle, RoomEvent, RoomName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Joined => "joined",
            Self::Closed => "closed",
        }
    }
}

/// What the transport should do with an event from the outbound queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Send(OutboundFrame),
    Close,
}

pub struct ConnectionSession {
    state: SessionState,
    handle: ConnectionHandle,
    room: Option<RoomName>,
    engine: Arc<BroadcastEngine>,
}

impl ConnectionSession {
    pub fn new(engine: Arc<BroadcastEngine>, handle: ConnectionHandle) -> Self {
        Self {
            state: SessionState::Connecting,
            handle,
            room: None,
            engine,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Joined && self.handle.is_evicted() {
            return SessionState::Closed;
        }
        self.state
    }

    pub fn room(&self) -> Option<&RoomName> {
        self.room.as_ref()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Joins `room_name`, creating the room if needed.
    ///
    /// Any failure closes the session without leaving a registration behind.
    pub async fn connect(&mut self, room_name: &str) -> ChatResult<()> {
        if self.state != SessionState::Connecting {
            return Err(ChatError::InvalidState(self.state.as_str()));
        }

        let room = match RoomName::parse(room_name) {
            Ok(room) => room,
            Err(err) => {
                self.state = SessionState::Closed;
                return Err(err);
            }
        };

        if let Err(err) = self.engine.admit(&room, self.handle.user()).await {
            self.state = SessionState::Closed;
            return Err(err);
        }

        self.engine.registry().join(&room, self.handle.clone()).await;
        tracing::info!(%room, user = self.handle.user(), connection = %self.handle.id(), "joined");

        self.room = Some(room);
        self.state = SessionState::Joined;
        Ok(())
    }

    /// Submits a client frame to the joined room as this connection's user.
    pub async fn receive(&mut self, frame: InboundFrame) -> ChatResult<ChatMessage> {
        self.observe_eviction();
        let (SessionState::Joined, Some(room)) = (self.state, &self.room) else {
            return Err(ChatError::InvalidState(self.state.as_str()));
        };

        if let Some(target) = frame.room.as_deref().filter(|target| *target != room.as_str()) {
            return Err(ChatError::RoomMismatch {
                expected: room.to_string(),
                got: target.to_owned(),
            });
        }

        self.engine.submit(room, self.handle.user(), &frame.message).await
    }

    /// Maps a queued event to what the transport should send.
    pub fn on_event(&mut self, event: RoomEvent) -> Option<Outbound> {
        if self.state != SessionState::Joined {
            return None;
        }
        if self.observe_eviction() {
            return Some(Outbound::Close);
        }

        match event {
            RoomEvent::Message(msg) if Some(&msg.room) == self.room.as_ref() => {
                Some(Outbound::Send(OutboundFrame::from(&msg)))
            }
            RoomEvent::Message(msg) => {
                tracing::debug!(room = %msg.room, "event for another room ignored");
                None
            }
            RoomEvent::Left { room } if Some(&room) == self.room.as_ref() => Some(Outbound::Close),
            RoomEvent::Left { .. } => None,
        }
    }

    /// Moves a joined session to `Closed` if its handle was evicted. Returns
    /// whether that happened now.
    fn observe_eviction(&mut self) -> bool {
        if self.state == SessionState::Joined && self.handle.is_evicted() {
            tracing::debug!(connection = %self.handle.id(), "session evicted");
            self.state = SessionState::Closed;
            return true;
        }
        false
    }

    /// Removes the connection from every room. Idempotent.
    pub async fn disconnect(&mut self) {
        let left = self.engine.registry().drop_all(self.handle.id()).await;
        if self.state != SessionState::Closed {
            tracing::info!(user = self.handle.user(), connection = %self.handle.id(), rooms = left.len(), "disconnected");
        }
        self.state = SessionState::Closed;
    }
}
