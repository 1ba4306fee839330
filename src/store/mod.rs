//! Durable storage for rooms, memberships and chat messages.
//!
//! Two backends implement the same traits: [`SqliteStore`] for deployments and
//! [`MemoryStore`] for tests, which can also simulate an outage.
//!
//! Ids and timestamps are assigned by the store under a single writer lock, so
//! within a room `id` order and `timestamp` order always agree.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{error::{ChatError, ChatResult}, rooms::RoomName};

pub type MessageId = i64;

/// A persisted chat message. Never constructed outside a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room: RoomName,
    pub user: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub trait MessageStore: Send + Sync {
    /// Persists a message and returns it with its id and timestamp.
    ///
    /// Resolves only once the write is durable. Empty content is rejected
    /// before storage is touched.
    fn append<'a>(
        &'a self,
        room: &'a RoomName,
        author: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, ChatResult<ChatMessage>>;

    /// Messages of `room` ordered by timestamp, then id. `since` is an
    /// exclusive lower bound on the message id.
    fn list<'a>(
        &'a self,
        room: &'a RoomName,
        since: Option<MessageId>,
    ) -> BoxFuture<'a, ChatResult<Vec<ChatMessage>>>;
}

pub trait RoomStore: Send + Sync {
    /// Get-or-create.
    fn ensure_room<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<()>>;

    /// Fails with [`ChatError::RoomExists`] if the name is taken.
    fn create_room<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<()>>;

    fn room_exists<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<bool>>;

    fn add_member<'a>(&'a self, room: &'a RoomName, user: &'a str) -> BoxFuture<'a, ChatResult<()>>;

    /// Returns whether `user` was a member.
    fn remove_member<'a>(&'a self, room: &'a RoomName, user: &'a str) -> BoxFuture<'a, ChatResult<bool>>;

    fn room_members<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<Vec<String>>>;
}

pub trait Store: MessageStore + RoomStore {}

impl<T: MessageStore + RoomStore> Store for T {}

pub(crate) fn validate_content(content: &str) -> ChatResult<()> {
    if content.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    Ok(())
}

/// Current time in unix microseconds, never earlier than `last`.
pub(crate) fn next_timestamp_micros(last: Option<i64>) -> i64 {
    let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64;
    last.map_or(now, |last| now.max(last))
}

pub(crate) fn from_micros(micros: i64) -> ChatResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).map_err(ChatError::storage)
}
