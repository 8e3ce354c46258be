//! Message store contract.
//!
//! The store is the durable source of truth for every message. Handles only
//! cache what the store can always produce again.
//!
//! # Transactional context
//!
//! Every mutating call takes a [`StoreContext`] owned by the caller. Outside a
//! transaction a mutation is applied immediately. Between
//! [`MessageStore::begin_tran`] and [`MessageStore::commit_tran`] mutations
//! are staged per context and applied together; [`MessageStore::abort_tran`]
//! discards them.
//!
//! Reads of a message's metadata and chunks also see writes staged by any
//! open transaction, so a handle receiving under a transaction can refetch
//! anything it caches before the commit. Queue membership only ever reflects
//! committed state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{ContentChunk, MessageId, MessageMetaData, QueueName};
use crate::{MessageError, MessageResult};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a [`StoreContext`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller-scoped unit of work passed through to every mutating store call.
///
/// Cloning a context yields the same unit of work.
#[derive(Clone, Debug)]
pub struct StoreContext {
    id: ContextId,
    name: Arc<str>,
}

impl StoreContext {
    /// Creates a context with a fresh id. The name is only used in logs.
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Durable backend for message metadata, content and queue membership.
pub trait MessageStore: Send + Sync {
    /// Allocates a fresh, never reused message id.
    fn new_message_id(&self) -> MessageId;

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Starts staging mutations made under `ctx`.
    ///
    /// Fails with `InvalidState` if `ctx` is already in a transaction.
    fn begin_tran(&self, ctx: &StoreContext) -> MessageResult<()>;

    /// Atomically applies every mutation staged under `ctx`.
    ///
    /// Fails with `InvalidState` if `ctx` is not in a transaction.
    fn commit_tran(&self, ctx: &StoreContext) -> MessageResult<()>;

    /// Discards every mutation staged under `ctx`.
    ///
    /// Fails with `InvalidState` if `ctx` is not in a transaction.
    fn abort_tran(&self, ctx: &StoreContext) -> MessageResult<()>;

    /// Returns true if `ctx` is in a transaction.
    fn in_tran(&self, ctx: &StoreContext) -> bool;

    // ========================================================================
    // Messages
    // ========================================================================

    /// Reads the metadata of a message, including a staged record.
    /// `NotFound` if none was stored.
    fn get_message_meta_data(&self, id: MessageId) -> MessageResult<MessageMetaData>;

    /// Reads one chunk of a message body, including a staged chunk.
    /// `NotFound` if absent.
    fn get_content_chunk(&self, id: MessageId, index: usize) -> MessageResult<ContentChunk>;

    /// Stores one chunk of a message body at `index`.
    fn store_content_chunk(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        index: usize,
        chunk: &ContentChunk,
    ) -> MessageResult<()>;

    /// Stores the metadata of a message, replacing any previous record.
    fn store_message_meta_data(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        meta: &MessageMetaData,
    ) -> MessageResult<()>;

    /// Erases every durable trace of a message: metadata, chunks and queue
    /// membership.
    fn remove_message(&self, ctx: &StoreContext, id: MessageId) -> MessageResult<()>;

    // ========================================================================
    // Queues
    // ========================================================================

    /// Records that `id` is on `queue`.
    fn enqueue_message(
        &self,
        ctx: &StoreContext,
        queue: &QueueName,
        id: MessageId,
    ) -> MessageResult<()>;

    /// Removes `id` from `queue`. Removing an absent entry is a no-op.
    fn dequeue_message(
        &self,
        ctx: &StoreContext,
        queue: &QueueName,
        id: MessageId,
    ) -> MessageResult<()>;

    /// Committed members of `queue`, in ascending id order.
    fn queue_messages(&self, queue: &QueueName) -> MessageResult<Vec<MessageId>>;
}

/// A mutation as it is staged inside a transaction.
#[derive(Clone, Debug)]
pub(crate) enum StoreOp {
    StoreChunk {
        id: MessageId,
        index: usize,
        chunk: ContentChunk,
    },
    StoreMetaData {
        id: MessageId,
        meta: MessageMetaData,
    },
    RemoveMessage {
        id: MessageId,
    },
    Enqueue {
        queue: QueueName,
        id: MessageId,
    },
    Dequeue {
        queue: QueueName,
        id: MessageId,
    },
}

/// What open transactions have staged for one record.
#[derive(Debug, PartialEq)]
pub(crate) enum Staged<T> {
    /// Nothing staged; read the committed record.
    Untouched,
    /// A staged write; it wins over the committed record.
    Written(T),
    /// A staged removal hides the committed record.
    Removed,
}

/// Per-context staging area shared by the store implementations.
#[derive(Debug, Default)]
pub(crate) struct TransactionTable {
    open: Mutex<HashMap<ContextId, Vec<StoreOp>>>,
}

impl TransactionTable {
    pub(crate) fn begin(&self, ctx: &StoreContext) -> MessageResult<()> {
        let mut open = self.open.lock();
        if open.contains_key(&ctx.id()) {
            return Err(MessageError::InvalidState(format!(
                "context {ctx} is already in a transaction"
            )));
        }
        open.insert(ctx.id(), Vec::new());
        Ok(())
    }

    /// Stages `op` if `ctx` is in a transaction, otherwise hands it back so
    /// the caller can apply it immediately.
    pub(crate) fn stage(&self, ctx: &StoreContext, op: StoreOp) -> Option<StoreOp> {
        let mut open = self.open.lock();
        match open.get_mut(&ctx.id()) {
            Some(ops) => {
                ops.push(op);
                None
            }
            None => Some(op),
        }
    }

    /// Ends the transaction of `ctx`, returning its staged mutations in order.
    pub(crate) fn finish(&self, ctx: &StoreContext) -> MessageResult<Vec<StoreOp>> {
        self.open.lock().remove(&ctx.id()).ok_or_else(|| {
            MessageError::InvalidState(format!("context {ctx} is not in a transaction"))
        })
    }

    pub(crate) fn is_open(&self, ctx: &StoreContext) -> bool {
        self.open.lock().contains_key(&ctx.id())
    }

    /// Latest staged state of the metadata of `id`.
    pub(crate) fn staged_meta_data(&self, id: MessageId) -> Staged<MessageMetaData> {
        let open = self.open.lock();
        let mut staged = Staged::Untouched;
        for op in open.values().flatten() {
            match op {
                StoreOp::StoreMetaData { id: target, meta } if *target == id => {
                    staged = Staged::Written(meta.clone());
                }
                StoreOp::RemoveMessage { id: target } if *target == id => {
                    staged = Staged::Removed;
                }
                _ => {}
            }
        }
        staged
    }

    /// Latest staged state of chunk `index` of `id`.
    pub(crate) fn staged_chunk(&self, id: MessageId, index: usize) -> Staged<ContentChunk> {
        let open = self.open.lock();
        let mut staged = Staged::Untouched;
        for op in open.values().flatten() {
            match op {
                StoreOp::StoreChunk {
                    id: target,
                    index: at,
                    chunk,
                } if *target == id && *at == index => {
                    staged = Staged::Written(chunk.clone());
                }
                StoreOp::RemoveMessage { id: target } if *target == id => {
                    staged = Staged::Removed;
                }
                _ => {}
            }
        }
        staged
    }
}
