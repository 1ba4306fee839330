//! In-memory map of room name to the live connections joined to it.
//!
//! The outer lock only guards the room map; every room has its own member
//! lock, so traffic in one room never waits on another. A join holds the
//! outer read lock until its insert lands, and pruning an empty room takes the
//! outer write lock, so a join can never end up in a pruned set.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use super::{ConnectionHandle, ConnectionId, RoomName};

type Members = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomName, Members>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `room`. Returns `false` if it was already there.
    pub async fn join(&self, room: &RoomName, handle: ConnectionHandle) -> bool {
        {
            let rooms = self.rooms.read().await;
            if let Some(members) = rooms.get(room) {
                return members.write().await.insert(handle.id(), handle).is_none();
            }
        }

        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.clone()).or_default();
        let inserted = members.write().await.insert(handle.id(), handle).is_none();
        inserted
    }

    /// Removes the connection from `room`. Returns `false` if it was not a member.
    pub async fn leave(&self, room: &RoomName, id: ConnectionId) -> bool {
        let (removed, now_empty) = {
            let rooms = self.rooms.read().await;
            let Some(members) = rooms.get(room) else {
                return false;
            };
            let mut members = members.write().await;
            (members.remove(&id).is_some(), members.is_empty())
        };

        if now_empty {
            self.prune(room).await;
        }
        removed
    }

    /// Snapshot of the room's members, safe to iterate while others join or leave.
    pub async fn members(&self, room: &RoomName) -> Vec<ConnectionHandle> {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(members) => members.read().await.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Removes the connection from every room. Returns the rooms it was in.
    pub async fn drop_all(&self, id: ConnectionId) -> Vec<RoomName> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        let mut empty = Vec::new();

        for (name, members) in rooms.iter() {
            let mut members = members.write().await;
            if members.remove(&id).is_some() {
                left.push(name.clone());
            }
            if members.is_empty() {
                empty.push(name.clone());
            }
        }

        for name in empty {
            rooms.remove(&name);
        }
        left
    }

    /// Live connections of `user` in `room`.
    pub async fn user_handles(&self, room: &RoomName, user: &str) -> Vec<ConnectionHandle> {
        self.members(room)
            .await
            .into_iter()
            .filter(|handle| handle.user() == user)
            .collect()
    }

    pub async fn member_count(&self, room: &RoomName) -> usize {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(members) => members.read().await.len(),
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn prune(&self, room: &RoomName) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(room) {
            Some(members) => members.read().await.is_empty(),
            None => false,
        };
        if empty {
            rooms.remove(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).unwrap()
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = RoomRegistry::new();
        let (alice, _rx) = ConnectionHandle::new("alice", 4);

        assert!(registry.join(&room("general"), alice.clone()).await);
        assert!(!registry.join(&room("general"), alice.clone()).await);
        assert_eq!(registry.members(&room("general")).await, vec![alice]);
    }

    #[tokio::test]
    async fn leave_twice_is_fine() {
        let registry = RoomRegistry::new();
        let general = room("general");
        let (alice, _rx_a) = ConnectionHandle::new("alice", 4);
        let (bob, _rx_b) = ConnectionHandle::new("bob", 4);

        registry.join(&general, alice.clone()).await;
        registry.join(&general, bob.clone()).await;

        assert!(registry.leave(&general, alice.id()).await);
        assert!(!registry.leave(&general, alice.id()).await);
        assert!(!registry.leave(&room("elsewhere"), alice.id()).await);
        assert_eq!(registry.members(&general).await, vec![bob]);
    }

    #[tokio::test]
    async fn empty_rooms_are_pruned() {
        let registry = RoomRegistry::new();
        let general = room("general");
        let (alice, _rx) = ConnectionHandle::new("alice", 4);

        registry.join(&general, alice.clone()).await;
        assert_eq!(registry.room_count().await, 1);
        registry.leave(&general, alice.id()).await;
        assert_eq!(registry.room_count().await, 0);

        registry.join(&general, alice.clone()).await;
        assert_eq!(registry.member_count(&general).await, 1);
    }

    #[tokio::test]
    async fn drop_all_clears_every_room() {
        let registry = RoomRegistry::new();
        let (alice, _rx_a) = ConnectionHandle::new("alice", 4);
        let (bob, _rx_b) = ConnectionHandle::new("bob", 4);

        for name in ["a", "b", "c"] {
            registry.join(&room(name), alice.clone()).await;
        }
        registry.join(&room("a"), bob.clone()).await;

        let mut left = registry.drop_all(alice.id()).await;
        left.sort();
        assert_eq!(left, vec![room("a"), room("b"), room("c")]);

        assert_eq!(registry.members(&room("a")).await, vec![bob]);
        assert!(registry.members(&room("b")).await.is_empty());
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.drop_all(alice.id()).await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_not_live() {
        let registry = RoomRegistry::new();
        let general = room("general");
        let (alice, _rx_a) = ConnectionHandle::new("alice", 4);
        let (bob, _rx_b) = ConnectionHandle::new("bob", 4);

        registry.join(&general, alice.clone()).await;
        let snapshot = registry.members(&general).await;
        registry.join(&general, bob).await;
        registry.leave(&general, alice.id()).await;

        assert_eq!(snapshot, vec![alice]);
    }

    #[tokio::test]
    async fn user_handles_tracks_each_connection() {
        let registry = RoomRegistry::new();
        let general = room("general");
        let (phone, _rx_p) = ConnectionHandle::new("alice", 4);
        let (laptop, _rx_l) = ConnectionHandle::new("alice", 4);
        let (bob, _rx_b) = ConnectionHandle::new("bob", 4);

        registry.join(&general, phone.clone()).await;
        registry.join(&general, laptop.clone()).await;
        registry.join(&general, bob).await;

        let mut handles: Vec<_> = registry.user_handles(&general, "alice").await.iter().map(|h| h.id()).collect();
        handles.sort();
        let mut expected = vec![phone.id(), laptop.id()];
        expected.sort();
        assert_eq!(handles, expected);
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves() {
        let registry = Arc::new(RoomRegistry::new());
        let general = room("general");

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            let general = general.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, rx) = ConnectionHandle::new(format!("user{i}"), 4);
                registry.join(&general, handle.clone()).await;
                if i % 2 == 0 {
                    registry.drop_all(handle.id()).await;
                }
                (handle, rx)
            }));
        }

        let mut kept = Vec::new();
        for task in tasks {
            kept.push(task.await.unwrap());
        }

        assert_eq!(registry.member_count(&general).await, 16);
    }
}
