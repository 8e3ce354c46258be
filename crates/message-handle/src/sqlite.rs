//! SQLite-backed message store.
//!
//! SQLite is the durable record of every message. Handles rebuild anything
//! they cache from here.
//!
//! # Layout
//!
//! - `messages` - one row per finalized message, metadata as JSON
//! - `message_chunks` - body chunks keyed by `(message_id, chunk_index)`
//! - `queue_entries` - queue membership keyed by `(queue_name, message_id)`
//!
//! A transaction staged on a [`StoreContext`] is applied inside a single
//! SQLite transaction on commit.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use broker_config::StoreConfig;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{MessageStore, Staged, StoreContext, StoreOp, TransactionTable};
use crate::types::{ContentChunk, MessageId, MessageMetaData, QueueName};
use crate::{MessageError, MessageResult, StoreFailure};

fn read_err(e: impl Into<StoreFailure>) -> MessageError {
    MessageError::StoreRead(e.into())
}

fn write_err(e: impl Into<StoreFailure>) -> MessageError {
    MessageError::StoreWrite(e.into())
}

/// A [`MessageStore`] persisted in a SQLite database.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
    next_id: AtomicU64,
    transactions: TransactionTable,
}

impl SqliteMessageStore {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist. Message ids
    /// resume after the highest id already on disk.
    pub fn open(path: impl AsRef<Path>) -> MessageResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(write_err)?;
        let store = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "sqlite message store opened");
        Ok(store)
    }

    /// Creates an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn in_memory() -> MessageResult<Self> {
        let conn = Connection::open_in_memory().map_err(write_err)?;
        Self::from_connection(conn)
    }

    /// Opens the store described by configuration: the configured file, or
    /// an in-memory database when no path is set.
    pub fn from_config(config: &StoreConfig) -> MessageResult<Self> {
        match &config.path {
            Some(path) => Self::open(path),
            None => Self::in_memory(),
        }
    }

    fn from_connection(conn: Connection) -> MessageResult<Self> {
        Self::init_schema(&conn)?;
        let highest = Self::highest_message_id(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            next_id: AtomicU64::new(highest + 1),
            transactions: TransactionTable::default(),
        })
    }

    /// Initializes the database schema.
    fn init_schema(conn: &Connection) -> MessageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                metadata TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_chunks (
                message_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (message_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS queue_entries (
                queue_name TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                PRIMARY KEY (queue_name, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_queue_entries_message ON queue_entries(message_id);
            "#,
        )
        .map_err(write_err)?;
        Ok(())
    }

    fn highest_message_id(conn: &Connection) -> MessageResult<u64> {
        let highest: i64 = conn
            .query_row(
                r#"
                SELECT MAX(
                    COALESCE((SELECT MAX(id) FROM messages), 0),
                    COALESCE((SELECT MAX(message_id) FROM message_chunks), 0),
                    COALESCE((SELECT MAX(message_id) FROM queue_entries), 0)
                )
                "#,
                [],
                |row| row.get(0),
            )
            .map_err(read_err)?;
        Ok(highest.max(0) as u64)
    }

    /// Applies one mutation on `conn`, which may be a transaction.
    fn apply(conn: &Connection, op: &StoreOp) -> MessageResult<()> {
        match op {
            StoreOp::StoreChunk { id, index, chunk } => {
                conn.execute(
                    "INSERT OR REPLACE INTO message_chunks (message_id, chunk_index, payload) VALUES (?1, ?2, ?3)",
                    params![id.0 as i64, *index as i64, chunk.payload().as_ref()],
                )
                .map_err(write_err)?;
            }
            StoreOp::StoreMetaData { id, meta } => {
                let json = serde_json::to_string(meta).map_err(write_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO messages (id, metadata) VALUES (?1, ?2)",
                    params![id.0 as i64, json],
                )
                .map_err(write_err)?;
            }
            StoreOp::RemoveMessage { id } => {
                conn.execute("DELETE FROM messages WHERE id = ?1", params![id.0 as i64])
                    .map_err(write_err)?;
                conn.execute(
                    "DELETE FROM message_chunks WHERE message_id = ?1",
                    params![id.0 as i64],
                )
                .map_err(write_err)?;
                conn.execute(
                    "DELETE FROM queue_entries WHERE message_id = ?1",
                    params![id.0 as i64],
                )
                .map_err(write_err)?;
            }
            StoreOp::Enqueue { queue, id } => {
                conn.execute(
                    "INSERT OR IGNORE INTO queue_entries (queue_name, message_id) VALUES (?1, ?2)",
                    params![queue.as_str(), id.0 as i64],
                )
                .map_err(write_err)?;
            }
            StoreOp::Dequeue { queue, id } => {
                conn.execute(
                    "DELETE FROM queue_entries WHERE queue_name = ?1 AND message_id = ?2",
                    params![queue.as_str(), id.0 as i64],
                )
                .map_err(write_err)?;
            }
        }
        Ok(())
    }

    fn write(&self, ctx: &StoreContext, op: StoreOp) -> MessageResult<()> {
        if let Some(op) = self.transactions.stage(ctx, op) {
            let conn = self.conn.lock();
            Self::apply(&conn, &op)?;
        }
        Ok(())
    }
}

impl MessageStore for SqliteMessageStore {
    fn new_message_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn begin_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        self.transactions.begin(ctx)
    }

    fn commit_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        let ops = self.transactions.finish(ctx)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(write_err)?;
        for op in &ops {
            Self::apply(&tx, op)?;
        }
        tx.commit().map_err(write_err)?;
        tracing::debug!(context = %ctx, ops = ops.len(), "sqlite store: transaction committed");
        Ok(())
    }

    fn abort_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        let ops = self.transactions.finish(ctx)?;
        tracing::debug!(context = %ctx, ops = ops.len(), "sqlite store: transaction aborted");
        Ok(())
    }

    fn in_tran(&self, ctx: &StoreContext) -> bool {
        self.transactions.is_open(ctx)
    }

    fn get_message_meta_data(&self, id: MessageId) -> MessageResult<MessageMetaData> {
        let not_found = || MessageError::NotFound {
            id,
            what: "metadata".to_string(),
        };
        match self.transactions.staged_meta_data(id) {
            Staged::Written(meta) => return Ok(meta),
            Staged::Removed => return Err(not_found()),
            Staged::Untouched => {}
        }

        let json: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT metadata FROM messages WHERE id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?
        };

        let json = json.ok_or_else(not_found)?;
        serde_json::from_str(&json).map_err(read_err)
    }

    fn get_content_chunk(&self, id: MessageId, index: usize) -> MessageResult<ContentChunk> {
        let not_found = || MessageError::NotFound {
            id,
            what: format!("chunk {index}"),
        };
        match self.transactions.staged_chunk(id, index) {
            Staged::Written(chunk) => return Ok(chunk),
            Staged::Removed => return Err(not_found()),
            Staged::Untouched => {}
        }

        let payload: Option<Vec<u8>> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT payload FROM message_chunks WHERE message_id = ?1 AND chunk_index = ?2",
                params![id.0 as i64, index as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?
        };

        payload.map(ContentChunk::new).ok_or_else(not_found)
    }

    fn store_content_chunk(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        index: usize,
        chunk: &ContentChunk,
    ) -> MessageResult<()> {
        self.write(
            ctx,
            StoreOp::StoreChunk {
                id,
                index,
                chunk: chunk.clone(),
            },
        )
    }

    fn store_message_meta_data(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        meta: &MessageMetaData,
    ) -> MessageResult<()> {
        self.write(
            ctx,
            StoreOp::StoreMetaData {
                id,
                meta: meta.clone(),
            },
        )
    }

    fn remove_message(&self, ctx: &StoreContext, id: MessageId) -> MessageResult<()> {
        self.write(ctx, StoreOp::RemoveMessage { id })
    }

    fn enqueue_message(
        &self,
        ctx: &StoreContext,
        queue: &QueueName,
        id: MessageId,
    ) -> MessageResult<()> {
        self.write(
            ctx,
            StoreOp::Enqueue {
                queue: queue.clone(),
                id,
            },
        )
    }

    fn dequeue_message(
        &self,
        ctx: &StoreContext,
        queue: &QueueName,
        id: MessageId,
    ) -> MessageResult<()> {
        self.write(
            ctx,
            StoreOp::Dequeue {
                queue: queue.clone(),
                id,
            },
        )
    }

    fn queue_messages(&self, queue: &QueueName) -> MessageResult<Vec<MessageId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT message_id FROM queue_entries WHERE queue_name = ?1 ORDER BY message_id",
            )
            .map_err(read_err)?;
        let rows = stmt
            .query_map(params![queue.as_str()], |row| {
                Ok(MessageId(row.get::<_, i64>(0)? as u64))
            })
            .map_err(read_err)?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(read_err)?);
        }
        Ok(ids)
    }
}
