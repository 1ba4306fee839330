use std::{collections::{BTreeSet, HashMap}, sync::atomic::{AtomicBool, Ordering}};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::sync::Mutex;

use crate::{error::{ChatError, ChatResult}, rooms::RoomName};

use super::{from_micros, next_timestamp_micros, validate_content, ChatMessage, MessageId, MessageStore, RoomStore};

#[derive(Default)]
struct RoomData {
    members: BTreeSet<String>,
    messages: Vec<ChatMessage>,
    last_timestamp_us: Option<i64>,
}

#[derive(Default)]
struct Inner {
    next_id: MessageId,
    rooms: HashMap<RoomName, RoomData>,
}

/// Process-local store. `set_available(false)` makes every call fail with
/// [`ChatError::StorageUnavailable`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> ChatResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::storage("memory store is offline"))
        }
    }

    /// Total number of stored messages across rooms.
    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.rooms.values().map(|room| room.messages.len()).sum()
    }
}

impl MessageStore for MemoryStore {
    fn append<'a>(
        &'a self,
        room: &'a RoomName,
        author: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, ChatResult<ChatMessage>> {
        async move {
            validate_content(content)?;
            self.check_available()?;

            let mut inner = self.inner.lock().await;
            inner.next_id += 1;
            let id = inner.next_id;

            let data = inner
                .rooms
                .get_mut(room)
                .ok_or_else(|| ChatError::RoomNotFound(room.to_string()))?;
            let timestamp_us = next_timestamp_micros(data.last_timestamp_us);

            let message = ChatMessage {
                id,
                room: room.clone(),
                user: author.to_owned(),
                content: content.to_owned(),
                timestamp: from_micros(timestamp_us)?,
            };
            data.last_timestamp_us = Some(timestamp_us);
            data.messages.push(message.clone());
            Ok(message)
        }
        .boxed()
    }

    fn list<'a>(
        &'a self,
        room: &'a RoomName,
        since: Option<MessageId>,
    ) -> BoxFuture<'a, ChatResult<Vec<ChatMessage>>> {
        async move {
            self.check_available()?;
            let inner = self.inner.lock().await;
            let since = since.unwrap_or(0);
            Ok(inner
                .rooms
                .get(room)
                .map(|data| data.messages.iter().filter(|m| m.id > since).cloned().collect())
                .unwrap_or_default())
        }
        .boxed()
    }
}

impl RoomStore for MemoryStore {
    fn ensure_room<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<()>> {
        async move {
            self.check_available()?;
            self.inner.lock().await.rooms.entry(room.clone()).or_default();
            Ok(())
        }
        .boxed()
    }

    fn create_room<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<()>> {
        async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            if inner.rooms.contains_key(room) {
                return Err(ChatError::RoomExists(room.to_string()));
            }
            inner.rooms.insert(room.clone(), RoomData::default());
            Ok(())
        }
        .boxed()
    }

    fn room_exists<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<bool>> {
        async move {
            self.check_available()?;
            Ok(self.inner.lock().await.rooms.contains_key(room))
        }
        .boxed()
    }

    fn add_member<'a>(&'a self, room: &'a RoomName, user: &'a str) -> BoxFuture<'a, ChatResult<()>> {
        async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            let data = inner
                .rooms
                .get_mut(room)
                .ok_or_else(|| ChatError::RoomNotFound(room.to_string()))?;
            data.members.insert(user.to_owned());
            Ok(())
        }
        .boxed()
    }

    fn remove_member<'a>(&'a self, room: &'a RoomName, user: &'a str) -> BoxFuture<'a, ChatResult<bool>> {
        async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            let data = inner
                .rooms
                .get_mut(room)
                .ok_or_else(|| ChatError::RoomNotFound(room.to_string()))?;
            Ok(data.members.remove(user))
        }
        .boxed()
    }

    fn room_members<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<Vec<String>>> {
        async move {
            self.check_available()?;
            let inner = self.inner.lock().await;
            let data = inner
                .rooms
                .get(room)
                .ok_or_else(|| ChatError::RoomNotFound(room.to_string()))?;
            Ok(data.members.iter().cloned().collect())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outage_fails_appends_without_storing() {
        let store = MemoryStore::new();
        let general = RoomName::parse("general").unwrap();
        store.ensure_room(&general).await.unwrap();

        store.set_available(false);
        let err = store.append(&general, "alice", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::StorageUnavailable(_)));

        store.set_available(true);
        assert_eq!(store.message_count().await, 0);
        store.append(&general, "alice", "hi").await.unwrap();
        assert_eq!(store.message_count().await, 1);
    }

    #[tokio::test]
    async fn ids_are_global_and_monotonic() {
        let store = MemoryStore::new();
        let (a, b) = (RoomName::parse("a").unwrap(), RoomName::parse("b").unwrap());
        store.ensure_room(&a).await.unwrap();
        store.ensure_room(&b).await.unwrap();

        let ids: Vec<_> = [
            store.append(&a, "x", "1").await.unwrap().id,
            store.append(&b, "x", "2").await.unwrap().id,
            store.append(&a, "x", "3").await.unwrap().id,
        ]
        .into();
        assert_eq!(ids, vec![1, 2, 3]);

        let listed: Vec<_> = store.list(&a, None).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec![1, 3]);
    }
}
