use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::Mutex;

use crate::{error::{ChatError, ChatResult}, rooms::RoomName};

use super::{from_micros, next_timestamp_micros, validate_content, ChatMessage, MessageId, MessageStore, RoomStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS memberships (
    room_id INTEGER NOT NULL REFERENCES rooms(id),
    member TEXT NOT NULL,
    PRIMARY KEY (room_id, member)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id INTEGER NOT NULL REFERENCES rooms(id),
    author TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS messages_by_room ON messages (room_id, timestamp_us, id);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
    // single serialization point for id + timestamp assignment
    writer: Mutex<()>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> ChatResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Self::new(pool).await
    }

    /// Private in-memory database. One connection, since every sqlite
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> ChatResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool).await
    }

    pub async fn new(pool: SqlitePool) -> ChatResult<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, writer: Mutex::new(()) })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn room_id(&self, room: &RoomName) -> ChatResult<i64> {
        let Some((id,)): Option<(i64,)> = sqlx::query_as("SELECT id FROM rooms WHERE name=?")
            .bind(room.as_str())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Err(ChatError::RoomNotFound(room.to_string()));
        };
        Ok(id)
    }

    async fn append_inner(&self, room: &RoomName, author: &str, content: &str) -> ChatResult<ChatMessage> {
        validate_content(content)?;
        let room_id = self.room_id(room).await?;

        let _writer = self.writer.lock().await;
        // one statement, so the write lock is taken before the last timestamp
        // is read and other processes on the same file cannot interleave
        let (id, timestamp_us): (i64, i64) = sqlx::query_as(
            "INSERT INTO messages (room_id,author,content,timestamp_us) \
             SELECT ?1, ?2, ?3, MAX(?4, COALESCE(MAX(timestamp_us), ?4)) FROM messages WHERE room_id=?1 \
             RETURNING id, timestamp_us",
        )
            .bind(room_id)
            .bind(author)
            .bind(content)
            .bind(next_timestamp_micros(None))
            .fetch_one(&self.pool)
            .await?;

        Ok(ChatMessage {
            id,
            room: room.clone(),
            user: author.to_owned(),
            content: content.to_owned(),
            timestamp: from_micros(timestamp_us)?,
        })
    }

    async fn list_inner(&self, room: &RoomName, since: Option<MessageId>) -> ChatResult<Vec<ChatMessage>> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT m.id,m.author,m.content,m.timestamp_us FROM messages m \
             JOIN rooms r ON r.id = m.room_id \
             WHERE r.name=? AND m.id>? \
             ORDER BY m.timestamp_us, m.id",
        )
            .bind(room.as_str())
            .bind(since.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(id, user, content, timestamp_us)| {
                Ok(ChatMessage {
                    id,
                    room: room.clone(),
                    user,
                    content,
                    timestamp: from_micros(timestamp_us)?,
                })
            })
            .collect()
    }

    async fn create_room_inner(&self, room: &RoomName) -> ChatResult<()> {
        let result = sqlx::query("INSERT INTO rooms (name) VALUES (?)")
            .bind(room.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(ChatError::RoomExists(room.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl MessageStore for SqliteStore {
    fn append<'a>(
        &'a self,
        room: &'a RoomName,
        author: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, ChatResult<ChatMessage>> {
        self.append_inner(room, author, content).boxed()
    }

    fn list<'a>(
        &'a self,
        room: &'a RoomName,
        since: Option<MessageId>,
    ) -> BoxFuture<'a, ChatResult<Vec<ChatMessage>>> {
        self.list_inner(room, since).boxed()
    }
}

impl RoomStore for SqliteStore {
    fn ensure_room<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<()>> {
        async move {
            sqlx::query("INSERT INTO rooms (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(room.as_str())
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn create_room<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<()>> {
        self.create_room_inner(room).boxed()
    }

    fn room_exists<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<bool>> {
        async move {
            match self.room_id(room).await {
                Ok(_) => Ok(true),
                Err(ChatError::RoomNotFound(_)) => Ok(false),
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    fn add_member<'a>(&'a self, room: &'a RoomName, user: &'a str) -> BoxFuture<'a, ChatResult<()>> {
        async move {
            let room_id = self.room_id(room).await?;
            sqlx::query("INSERT OR IGNORE INTO memberships (room_id,member) VALUES (?,?)")
                .bind(room_id)
                .bind(user)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn remove_member<'a>(&'a self, room: &'a RoomName, user: &'a str) -> BoxFuture<'a, ChatResult<bool>> {
        async move {
            let room_id = self.room_id(room).await?;
            let result = sqlx::query("DELETE FROM memberships WHERE room_id=? AND member=?")
                .bind(room_id)
                .bind(user)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }
        .boxed()
    }

    fn room_members<'a>(&'a self, room: &'a RoomName) -> BoxFuture<'a, ChatResult<Vec<String>>> {
        async move {
            let room_id = self.room_id(room).await?;
            let members: Vec<(String,)> =
                sqlx::query_as("SELECT member FROM memberships WHERE room_id=? ORDER BY member")
                    .bind(room_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(members.into_iter().map(|(member,)| member).collect())
        }
        .boxed()
    }
}
