//! In-memory message store.
//!
//! Holds everything in process memory. Used as the reference store in tests
//! and for non-durable brokers. It counts reads and can be told to fail, so
//! tests can observe exactly how handles talk to their store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::store::{MessageStore, Staged, StoreContext, StoreOp, TransactionTable};
use crate::types::{ContentChunk, MessageId, MessageMetaData, QueueName};
use crate::{MessageError, MessageResult, StoreFailure};

#[derive(Debug, Default)]
struct MemoryState {
    metadata: HashMap<MessageId, MessageMetaData>,
    chunks: HashMap<MessageId, BTreeMap<usize, ContentChunk>>,
    queues: HashMap<QueueName, BTreeSet<MessageId>>,
}

impl MemoryState {
    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::StoreChunk { id, index, chunk } => {
                self.chunks.entry(id).or_default().insert(index, chunk);
            }
            StoreOp::StoreMetaData { id, meta } => {
                self.metadata.insert(id, meta);
            }
            StoreOp::RemoveMessage { id } => {
                self.metadata.remove(&id);
                self.chunks.remove(&id);
                for members in self.queues.values_mut() {
                    members.remove(&id);
                }
                self.queues.retain(|_, members| !members.is_empty());
            }
            StoreOp::Enqueue { queue, id } => {
                self.queues.entry(queue).or_default().insert(id);
            }
            StoreOp::Dequeue { queue, id } => {
                if let Some(members) = self.queues.get_mut(&queue) {
                    members.remove(&id);
                    if members.is_empty() {
                        self.queues.remove(&queue);
                    }
                }
            }
        }
    }
}

/// A [`MessageStore`] kept entirely in memory.
#[derive(Debug)]
pub struct MemoryMessageStore {
    next_id: AtomicU64,
    state: RwLock<MemoryState>,
    transactions: TransactionTable,
    metadata_reads: AtomicU64,
    chunk_reads: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: RwLock::new(MemoryState::default()),
            transactions: TransactionTable::default(),
            metadata_reads: AtomicU64::new(0),
            chunk_reads: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of `get_message_meta_data` calls served so far.
    pub fn metadata_reads(&self) -> u64 {
        self.metadata_reads.load(Ordering::SeqCst)
    }

    /// Number of `get_content_chunk` calls served so far.
    pub fn chunk_reads(&self) -> u64 {
        self.chunk_reads.load(Ordering::SeqCst)
    }

    /// Resets both read counters to zero.
    pub fn reset_read_counts(&self) {
        self.metadata_reads.store(0, Ordering::SeqCst);
        self.chunk_reads.store(0, Ordering::SeqCst);
    }

    /// Makes every subsequent read fail with `StoreRead` until turned off.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail with `StoreWrite` until turned off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns true if committed metadata exists for `id`.
    pub fn contains_message(&self, id: MessageId) -> bool {
        self.state.read().metadata.contains_key(&id)
    }

    /// Number of committed chunks stored for `id`.
    pub fn stored_chunk_count(&self, id: MessageId) -> usize {
        self.state.read().chunks.get(&id).map(|c| c.len()).unwrap_or(0)
    }

    fn check_read(&self) -> MessageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MessageError::StoreRead(StoreFailure::Backend(
                "injected read failure".to_string(),
            )));
        }
        Ok(())
    }

    fn write(&self, ctx: &StoreContext, op: StoreOp) -> MessageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MessageError::StoreWrite(StoreFailure::Backend(
                "injected write failure".to_string(),
            )));
        }
        if let Some(op) = self.transactions.stage(ctx, op) {
            self.state.write().apply(op);
        }
        Ok(())
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn new_message_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn begin_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        self.transactions.begin(ctx)
    }

    fn commit_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        let ops = self.transactions.finish(ctx)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MessageError::StoreWrite(StoreFailure::Backend(
                "injected commit failure".to_string(),
            )));
        }
        let count = ops.len();
        let mut state = self.state.write();
        for op in ops {
            state.apply(op);
        }
        tracing::debug!(context = %ctx, ops = count, "memory store: transaction committed");
        Ok(())
    }

    fn abort_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        let ops = self.transactions.finish(ctx)?;
        tracing::debug!(context = %ctx, ops = ops.len(), "memory store: transaction aborted");
        Ok(())
    }

    fn in_tran(&self, ctx: &StoreContext) -> bool {
        self.transactions.is_open(ctx)
    }

    fn get_message_meta_data(&self, id: MessageId) -> MessageResult<MessageMetaData> {
        self.check_read()?;
        self.metadata_reads.fetch_add(1, Ordering::SeqCst);
        let found = match self.transactions.staged_meta_data(id) {
            Staged::Written(meta) => Some(meta),
            Staged::Removed => None,
            Staged::Untouched => self.state.read().metadata.get(&id).cloned(),
        };
        found.ok_or_else(|| MessageError::NotFound {
            id,
            what: "metadata".to_string(),
        })
    }

    fn get_content_chunk(&self, id: MessageId, index: usize) -> MessageResult<ContentChunk> {
        self.check_read()?;
        self.chunk_reads.fetch_add(1, Ordering::SeqCst);
        let found = match self.transactions.staged_chunk(id, index) {
            Staged::Written(chunk) => Some(chunk),
            Staged::Removed => None,
            Staged::Untouched => self
                .state
                .read()
                .chunks
                .get(&id)
                .and_then(|chunks| chunks.get(&index))
                .cloned(),
        };
        found.ok_or_else(|| MessageError::NotFound {
            id,
            what: format!("chunk {index}"),
        })
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
        self.check_read()?;
        Ok(self
            .state
            .read()
            .queues
            .get(queue)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BasicProperties, ContentHeader, PublishDescriptor};

    fn meta(chunks: usize) -> MessageMetaData {
        MessageMetaData::new(
            ContentHeader::basic(3, BasicProperties::default()),
            PublishDescriptor::new("amq.direct", "rk"),
            chunks,
        )
    }

    #[test]
    fn ids_are_monotonic() {
        let store = MemoryMessageStore::new();
        let a = store.new_message_id();
        let b = store.new_message_id();
        assert!(b > a);
    }

    #[test]
    fn metadata_round_trip_and_not_found() {
        let store = MemoryMessageStore::new();
        let ctx = StoreContext::new("test");
        let id = store.new_message_id();

        assert!(matches!(
            store.get_message_meta_data(id),
            Err(MessageError::NotFound { .. })
        ));

        store.store_message_meta_data(&ctx, id, &meta(1)).unwrap();
        assert_eq!(store.get_message_meta_data(id).unwrap(), meta(1));
        assert_eq!(store.metadata_reads(), 2);
    }

    #[test]
    fn chunks_are_addressed_by_index() {
        let store = MemoryMessageStore::new();
        let ctx = StoreContext::new("test");
        let id = store.new_message_id();

        store
            .store_content_chunk(&ctx, id, 1, &ContentChunk::from(&b"second"[..]))
            .unwrap();
        store
            .store_content_chunk(&ctx, id, 0, &ContentChunk::from(&b"first"[..]))
            .unwrap();

        assert_eq!(
            store.get_content_chunk(id, 0).unwrap().payload().as_ref(),
            b"first"
        );
        assert_eq!(
            store.get_content_chunk(id, 1).unwrap().payload().as_ref(),
            b"second"
        );
        assert!(matches!(
            store.get_content_chunk(id, 2),
            Err(MessageError::NotFound { .. })
        ));
        assert_eq!(store.stored_chunk_count(id), 2);
    }

    #[test]
    fn remove_erases_metadata_chunks_and_membership() {
        let store = MemoryMessageStore::new();
        let ctx = StoreContext::new("test");
        let id = store.new_message_id();
        let queue = QueueName::from("q");

        store
            .store_content_chunk(&ctx, id, 0, &ContentChunk::from(&b"x"[..]))
            .unwrap();
        store.store_message_meta_data(&ctx, id, &meta(1)).unwrap();
        store.enqueue_message(&ctx, &queue, id).unwrap();

        store.remove_message(&ctx, id).unwrap();

        assert!(!store.contains_message(id));
        assert_eq!(store.stored_chunk_count(id), 0);
        assert!(store.queue_messages(&queue).unwrap().is_empty());
    }

    #[test]
    fn dequeue_of_absent_entry_is_a_no_op() {
        let store = MemoryMessageStore::new();
        let ctx = StoreContext::new("test");

        store
            .dequeue_message(&ctx, &QueueName::from("q"), MessageId(5))
            .unwrap();
        assert!(store.queue_messages(&QueueName::from("q")).unwrap().is_empty());
    }

    #[test]
    fn injected_failures_surface_as_store_errors() {
        let store = MemoryMessageStore::new();
        let ctx = StoreContext::new("test");

        store.set_fail_writes(true);
        assert!(matches!(
            store.store_message_meta_data(&ctx, MessageId(1), &meta(0)),
            Err(MessageError::StoreWrite(_))
        ));
        store.set_fail_writes(false);

        store.set_fail_reads(true);
        assert!(matches!(
            store.get_message_meta_data(MessageId(1)),
            Err(MessageError::StoreRead(_))
        ));
    }
}
