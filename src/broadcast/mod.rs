//! Persist-then-fan-out message pipeline.
//!
//! ```text
//!  submit ──► validate ──► MessageStore::append ──► RoomRegistry::members (snapshot)
//!                                                     │
//!                                   ConnectionHandle::deliver (per member, non-blocking)
//!                                                     │
//!                                   Relay::publish (spawned) ──► other instances
//!                                                                    │
//!  Relay::subscribe ◄────────────────────────────────────────────────┘
//!        │
//!        └──► receive_relayed ──► dedup by (origin, id) ──► local fan-out only
//! ```
//!
//! A message is handed to connections only after the store returned it, so
//! nothing a client sees can vanish on restart. Storage failure aborts before
//! any delivery. Delivery and relay failures are logged and never reach the
//! author.
//!
//! Append and fan-out for one room run under that room's sequencing lock, so
//! every member of a room receives its messages in persistence order. Rooms
//! do not contend with each other, and the registry is only locked for the
//! duration of the snapshot. Relay publishing runs on its own task, so a slow
//! peer never holds up the author.

pub mod relay;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};

use tokio::{sync::{broadcast::error::RecvError, Mutex}, task::JoinHandle};
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatResult},
    rooms::{RoomEvent, RoomName, RoomRegistry},
    store::{validate_content, ChatMessage, MessageId, MessageStore, RoomStore, Store},
};

pub use relay::{HttpRelay, LocalRelay, Relay, RelayEnvelope};

const RECENT_IDS: usize = 4096;

/// Instance that persisted a message plus the id its store assigned. Ids are
/// only unique within one store, so the origin is part of the key.
type MessageKey = (Uuid, MessageId);

/// Bounded set of recently fanned-out messages.
struct RecentIds {
    order: VecDeque<MessageKey>,
    ids: HashSet<MessageKey>,
}

impl RecentIds {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(RECENT_IDS),
            ids: HashSet::with_capacity(RECENT_IDS),
        }
    }

    /// Returns `false` if the key was already recorded.
    fn insert(&mut self, id: MessageKey) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_IDS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

pub struct BroadcastEngine {
    instance: Uuid,
    store: Arc<dyn Store>,
    registry: Arc<RoomRegistry>,
    relay: Arc<dyn Relay>,
    sequencers: Mutex<HashMap<RoomName, Arc<Mutex<()>>>>,
    recent: StdMutex<RecentIds>,
}

impl BroadcastEngine {
    pub fn new(store: Arc<dyn Store>, registry: Arc<RoomRegistry>, relay: Arc<dyn Relay>) -> Self {
        Self {
            instance: Uuid::now_v7(),
            store,
            registry,
            relay,
            sequencers: Mutex::new(HashMap::new()),
            recent: StdMutex::new(RecentIds::new()),
        }
    }

    /// Id stamped on envelopes this instance publishes.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Persists a message and fans it out to the room.
    ///
    /// Returns the stored message once local delivery has been queued. The
    /// room must already exist.
    pub async fn submit(&self, room: &RoomName, author: &str, content: &str) -> ChatResult<ChatMessage> {
        validate_content(content)?;
        if !self.store.room_exists(room).await? {
            return Err(ChatError::RoomNotFound(room.to_string()));
        }

        let appended = {
            let sequencer = self.sequencer(room).await;
            let _turn = sequencer.lock().await;

            match self.store.append(room, author, content).await {
                Ok(message) => {
                    self.remember(self.instance, message.id);
                    self.fan_out(&message).await;
                    Ok(message)
                }
                Err(err) => Err(err),
            }
        };
        self.release_sequencer(room).await;

        let message = appended.inspect_err(|err| {
            tracing::warn!(%room, user = author, error = %err, "message not persisted");
        })?;
        self.publish(&message);
        Ok(message)
    }

    /// Local fan-out of a message persisted by another instance.
    ///
    /// Returns how many local connections it was queued for. Envelopes from
    /// this instance and ids already seen are skipped.
    pub async fn receive_relayed(&self, envelope: RelayEnvelope) -> usize {
        if envelope.origin == self.instance {
            return 0;
        }
        let message = envelope.message;

        let delivered = {
            let sequencer = self.sequencer(&message.room).await;
            let _turn = sequencer.lock().await;
            if self.remember(envelope.origin, message.id) {
                Some(self.fan_out(&message).await)
            } else {
                None
            }
        };
        self.release_sequencer(&message.room).await;

        delivered.unwrap_or_else(|| {
            tracing::debug!(origin = %envelope.origin, message_id = message.id, "duplicate relayed message dropped");
            0
        })
    }

    /// Feeds the relay subscription into [`receive_relayed`](Self::receive_relayed)
    /// until the engine is dropped or the relay closes.
    pub fn spawn_relay_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut inbound = self.relay.subscribe();
        let engine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(envelope) => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        engine.receive_relayed(envelope).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay listener lagged, messages were not fanned out");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("relay listener stopped");
        })
    }

    /// Get-or-create the room and record `user` as a member.
    pub async fn admit(&self, room: &RoomName, user: &str) -> ChatResult<()> {
        self.store.ensure_room(room).await?;
        self.store.add_member(room, user).await
    }

    /// Removes `user` from the room's persisted members and evicts the user's
    /// live connections from it. Returns the number of evicted connections.
    ///
    /// Eviction is flagged on the handle before it leaves the registry, so
    /// the session is closed even when the `Left` event cannot be queued.
    pub async fn leave(&self, room: &RoomName, user: &str) -> ChatResult<usize> {
        if !self.store.room_exists(room).await? {
            return Err(ChatError::RoomNotFound(room.to_string()));
        }
        self.store.remove_member(room, user).await?;

        let handles = self.registry.user_handles(room, user).await;
        for handle in &handles {
            handle.evict();
            self.registry.leave(room, handle.id()).await;
            if let Err(err) = handle.deliver(RoomEvent::Left { room: room.clone() }) {
                tracing::debug!(%room, connection = %handle.id(), error = %err, "left event not queued");
            }
        }

        tracing::info!(%room, user, connections = handles.len(), "user left room");
        Ok(handles.len())
    }

    async fn fan_out(&self, message: &ChatMessage) -> usize {
        let members = self.registry.members(&message.room).await;
        let mut delivered = 0;

        for handle in &members {
            match handle.deliver(RoomEvent::Message(message.clone())) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(room = %message.room, connection = %handle.id(), error = %err, "delivery failed");
                }
            }
        }

        tracing::debug!(room = %message.room, message_id = message.id, delivered, members = members.len(), "fanned out");
        delivered
    }

    fn publish(&self, message: &ChatMessage) {
        let relay = self.relay.clone();
        let envelope = RelayEnvelope {
            origin: self.instance,
            message: message.clone(),
        };

        tokio::spawn(async move {
            if let Err(err) = relay.publish(&envelope).await {
                let message = &envelope.message;
                tracing::warn!(room = %message.room, message_id = message.id, error = %err, "relay publish failed");
            }
        });
    }

    async fn sequencer(&self, room: &RoomName) -> Arc<Mutex<()>> {
        self.sequencers.lock().await.entry(room.clone()).or_default().clone()
    }

    /// Drops the room's sequencer once nobody else holds or waits on it.
    async fn release_sequencer(&self, room: &RoomName) {
        let mut sequencers = self.sequencers.lock().await;
        if sequencers.get(room).is_some_and(|sequencer| Arc::strong_count(sequencer) == 1) {
            sequencers.remove(room);
        }
    }

    fn remember(&self, origin: Uuid, id: MessageId) -> bool {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner).insert((origin, id))
    }
}
