//! # Message handle
//!
//! Per-message handles for an AMQP broker that serve headers, routing
//! information and body chunks from a bounded in-memory cache, falling back to
//! a persistent message store on every miss.
//!
//! ## Principles
//!
//! - **The store is the only durable record** - Every cached value can be
//!   rebuilt from it at any time
//! - **Eviction is invisible to correctness** - A reclaimed slot is refetched,
//!   never reported as an error
//! - **Header and publish descriptor travel together** - Both come from the
//!   same metadata record, so a miss on either repopulates both
//! - **Identity belongs to the caller** - Every store operation is keyed by the
//!   `MessageId` the caller supplies
//!
//! ## Architecture
//!
//! ```text
//! RECEIVE:
//!   add_chunk* → finalize → enqueue
//!        │           │          │
//!        ▼           ▼          ▼
//!      store       store      store
//!
//! DELIVER:
//!   header / chunk(i) → cache ──miss──▶ store → cache
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use message_handle::{
//!     BasicProperties, ContentChunk, ContentHeader, DeliveryMode, MemoryMessageStore,
//!     MessageRegistry, MessageStore, PublishDescriptor, QueueName, ReclaimableCache,
//!     StoreContext,
//! };
//!
//! let store = Arc::new(MemoryMessageStore::new());
//! let cache = Arc::new(ReclaimableCache::with_capacity(1024, 1 << 20));
//! let registry = MessageRegistry::new(store.clone(), cache);
//! let ctx = StoreContext::new("publisher");
//!
//! let id = store.new_message_id();
//! let handle = registry.create(id).unwrap();
//! handle.add_chunk(&ctx, id, ContentChunk::from(&b"hello "[..])).unwrap();
//! handle.add_chunk(&ctx, id, ContentChunk::from(&b"world"[..])).unwrap();
//! handle
//!     .finalize(
//!         &ctx,
//!         id,
//!         PublishDescriptor::new("amq.direct", "greetings"),
//!         ContentHeader::basic(11, BasicProperties::with_delivery_mode(DeliveryMode::PERSISTENT)),
//!     )
//!     .unwrap();
//! handle.enqueue(&ctx, id, &QueueName::from("greetings")).unwrap();
//!
//! assert!(handle.is_persistent(id).unwrap());
//! assert_eq!(handle.read_body(id).unwrap().as_ref(), b"hello world");
//! ```
//!
//! ## Crate Structure
//!
//! - [`handle`] - The per-message cache-over-store accessor
//! - [`cache`] - Bounded, reclaimable cache slots
//! - [`registry`] - MessageId-indexed arena of handles
//! - [`store`] - Message store contract and transactional context
//! - [`memory`] - In-memory message store
//! - [`sqlite`] - SQLite-backed message store
//! - [`types`] - Core types

pub mod cache;
pub mod handle;
pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use cache::{CacheStats, ReclaimableCache, Slot};
pub use handle::{MessageHandle, ReceptionPhase};
pub use memory::MemoryMessageStore;
pub use registry::MessageRegistry;
pub use sqlite::SqliteMessageStore;
pub use store::{ContextId, MessageStore, StoreContext};
pub use types::{
    BasicProperties, ContentChunk, ContentHeader, DeliveryMode, HeaderProperties, MessageId,
    MessageMetaData, PublishDescriptor, QueueName, BASIC_CLASS_ID,
};

/// Errors that can occur while handling messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The store holds no record for the message (or chunk) requested.
    #[error("message {id} not found: {what}")]
    NotFound { id: MessageId, what: String },

    /// The caller passed an argument outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The store failed to read.
    #[error("store read failed: {0}")]
    StoreRead(#[source] StoreFailure),

    /// The store failed to write.
    #[error("store write failed: {0}")]
    StoreWrite(#[source] StoreFailure),
}

/// Underlying cause of a store read or write failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreFailure {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Metadata encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// Result type alias using MessageError.
pub type MessageResult<T> = Result<T, MessageError>;
