use std::{fmt, hash::{Hash, Hasher}, sync::Arc};

use tokio::sync::{mpsc::{self, error::TrySendError}, watch};
use uuid::Uuid;

use crate::{error::ChatError, rooms::RoomName, store::ChatMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events pushed to a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A persisted message fanned out to the room.
    Message(ChatMessage),
    /// The user left the room through another channel; the connection closes.
    Left { room: RoomName },
}

/// Opaque address of one live connection.
///
/// Clones share the same outbound queue and eviction flag. Equality and
/// hashing only look at the connection id.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: Arc<str>,
    tx: mpsc::Sender<RoomEvent>,
    evicted: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Creates a handle and the receiving end its connection drains.
    pub fn new(user: impl Into<Arc<str>>, buffer: usize) -> (Self, mpsc::Receiver<RoomEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user: user.into(),
            tx,
            evicted: Arc::new(watch::Sender::new(false)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Queues an event without waiting.
    ///
    /// Events for a connection that already went away are dropped silently.
    /// A full queue means the client is not keeping up and the event is lost.
    pub fn deliver(&self, event: RoomEvent) -> Result<(), ChatError> {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChatError::DeliveryFailure {
                connection: self.id.to_string(),
                reason: "outbound queue full",
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Marks the connection as removed from its room by someone else.
    ///
    /// Unlike a queued [`RoomEvent::Left`] this cannot be lost to a full
    /// queue, and the owning session stops accepting frames right away.
    pub fn evict(&self) {
        self.evicted.send_replace(true);
    }

    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }

    /// Resolves once [`evict`](Self::evict) has been called on any clone.
    pub async fn evicted(&self) {
        let mut rx = self.evicted.subscribe();
        // the sender lives as long as `self`, so this only ends on eviction
        let _ = rx.wait_for(|evicted| *evicted).await;
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish()
    }
}
