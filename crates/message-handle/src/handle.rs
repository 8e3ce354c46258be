//! The message handle: a cache-over-store accessor for one message.
//!
//! A handle serves the header, publish descriptor and body chunks of a
//! message. Values come from the shared [`ReclaimableCache`] when present and
//! from the [`MessageStore`] otherwise; every fetched value is written back to
//! its slot.
//!
//! # Reception (strict order)
//!
//! 1. `add_chunk` for each body fragment, in order
//! 2. `finalize` with the publish descriptor and content header
//! 3. `enqueue` on every matching queue
//!
//! The reception pipeline is single-threaded per message; the handle does not
//! synchronize `add_chunk` against `finalize` beyond rejecting late chunks.
//!
//! # Transactions
//!
//! Chunks and metadata written under a context with an open transaction stay
//! readable through the store's staged view until the context finishes. The
//! handle remembers that context: [`MessageRegistry::commit_tran`] settles
//! it, and [`MessageRegistry::abort_tran`] discards the handle together with
//! its cached slots. A handle written under a transaction that is aborted
//! directly on the store must be discarded by the caller.
//!
//! [`MessageRegistry::commit_tran`]: crate::registry::MessageRegistry::commit_tran
//! [`MessageRegistry::abort_tran`]: crate::registry::MessageRegistry::abort_tran
//!
//! # Reads
//!
//! Reads are valid once the message is complete, either because this handle
//! finalized it or because its metadata already exists in the store. Any
//! number of threads may read concurrently. No lock is held across a store
//! call, so two readers may refetch the same reclaimed slot; both get the
//! same immutable value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::cache::ReclaimableCache;
use crate::store::{ContextId, MessageStore, StoreContext};
use crate::types::{
    ContentChunk, ContentHeader, DeliveryMode, MessageId, MessageMetaData, PublishDescriptor,
    QueueName,
};
use crate::{MessageError, MessageResult};

/// Where a handle is in the reception of its message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReceptionPhase {
    /// Nothing received yet.
    Empty,
    /// At least one chunk received, metadata not yet written.
    Receiving,
    /// Metadata written (or found in the store); the chunk count is fixed.
    Complete,
}

#[derive(Debug)]
struct HandleState {
    phase: ReceptionPhase,
    /// Known chunk count. Grows during reception, fixed once complete.
    chunk_count: Option<usize>,
    /// Context whose open transaction holds this handle's writes.
    staged_under: Option<ContextId>,
}

/// Header and publish descriptor fetched together from one metadata record.
struct FetchedMetaData {
    header: Arc<ContentHeader>,
    publish: Arc<PublishDescriptor>,
}

/// Per-message accessor over a shared cache and a message store.
pub struct MessageHandle<S: MessageStore> {
    store: Arc<S>,
    cache: Arc<ReclaimableCache>,
    state: RwLock<HandleState>,
    redelivered: AtomicBool,
}

impl<S: MessageStore> MessageHandle<S> {
    /// Creates an empty handle, ready to receive a new message or to read a
    /// message whose metadata is already in the store.
    pub fn new(store: Arc<S>, cache: Arc<ReclaimableCache>) -> Self {
        Self {
            store,
            cache,
            state: RwLock::new(HandleState {
                phase: ReceptionPhase::Empty,
                chunk_count: None,
                staged_under: None,
            }),
            redelivered: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> ReceptionPhase {
        self.state.read().phase
    }

    /// Context whose uncommitted transaction holds writes made by this
    /// handle, if any.
    pub fn staged_under(&self) -> Option<ContextId> {
        self.state.read().staged_under
    }

    /// Forgets `ctx` once its transaction has committed.
    pub(crate) fn settle(&self, ctx: ContextId) {
        let mut state = self.state.write();
        if state.staged_under == Some(ctx) {
            state.staged_under = None;
        }
    }

    fn note_write(&self, state: &mut HandleState, ctx: &StoreContext) {
        if self.store.in_tran(ctx) {
            state.staged_under = Some(ctx.id());
        }
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Returns the content header of the message.
    ///
    /// A miss refetches the metadata record and repopulates both the header
    /// and the publish descriptor slots.
    pub fn header(&self, id: MessageId) -> MessageResult<Arc<ContentHeader>> {
        if let Some(header) = self.cache.header(id) {
            return Ok(header);
        }
        Ok(self.refetch_meta_data(id)?.header)
    }

    /// Returns the publish descriptor of the message.
    ///
    /// A miss refetches the metadata record and repopulates both the header
    /// and the publish descriptor slots.
    pub fn publish_descriptor(&self, id: MessageId) -> MessageResult<Arc<PublishDescriptor>> {
        if let Some(publish) = self.cache.publish(id) {
            return Ok(publish);
        }
        Ok(self.refetch_meta_data(id)?.publish)
    }

    /// Total body size declared by the content header.
    pub fn body_size(&self, id: MessageId) -> MessageResult<u64> {
        Ok(self.header(id)?.body_size)
    }

    /// Returns true if the header's delivery mode is persistent.
    ///
    /// Schemas without a delivery mode, and headers that leave it unset, are
    /// not persistent.
    pub fn is_persistent(&self, id: MessageId) -> MessageResult<bool> {
        let header = self.header(id)?;
        Ok(header.properties.delivery_mode() == Some(DeliveryMode::PERSISTENT))
    }

    fn refetch_meta_data(&self, id: MessageId) -> MessageResult<FetchedMetaData> {
        tracing::debug!(message_id = %id, "cache miss: fetching message metadata");
        let MessageMetaData {
            header,
            publish,
            chunk_count,
        } = self.store.get_message_meta_data(id)?;

        let header = Arc::new(header);
        let publish = Arc::new(publish);
        self.cache.put_header(id, header.clone());
        self.cache.put_publish(id, publish.clone());
        self.observe_stored_chunk_count(chunk_count);

        Ok(FetchedMetaData { header, publish })
    }

    /// Metadata exists in the store, so the message is complete.
    fn observe_stored_chunk_count(&self, chunk_count: usize) {
        let mut state = self.state.write();
        if state.phase != ReceptionPhase::Complete {
            state.phase = ReceptionPhase::Complete;
            state.chunk_count = Some(chunk_count);
        }
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Number of body chunks.
    ///
    /// Fetches the metadata record at most once; after that the count is
    /// served from memory.
    pub fn chunk_count(&self, id: MessageId) -> MessageResult<usize> {
        if let Some(count) = self.state.read().chunk_count {
            return Ok(count);
        }

        let meta = self.store.get_message_meta_data(id)?;
        let stored = meta.chunk_count;
        self.observe_stored_chunk_count(stored);
        self.cache.put_header(id, Arc::new(meta.header));
        self.cache.put_publish(id, Arc::new(meta.publish));

        Ok(self.state.read().chunk_count.unwrap_or(stored))
    }

    /// Returns the chunk at `index`.
    ///
    /// Fails with `InvalidArgument` unless `0 <= index < chunk_count`. A miss
    /// fetches exactly this chunk from the store; other slots are untouched.
    pub fn chunk<I>(&self, id: MessageId, index: I) -> MessageResult<Arc<ContentChunk>>
    where
        I: TryInto<usize> + std::fmt::Display + Copy,
    {
        let count = self.chunk_count(id)?;
        let index = index
            .try_into()
            .ok()
            .filter(|i| *i < count)
            .ok_or_else(|| {
                MessageError::InvalidArgument(format!(
                    "chunk index {index} out of valid range 0..{count} for message {id}"
                ))
            })?;

        if let Some(chunk) = self.cache.chunk(id, index) {
            return Ok(chunk);
        }

        tracing::debug!(message_id = %id, index, "cache miss: fetching chunk");
        let chunk = Arc::new(self.store.get_content_chunk(id, index)?);
        self.cache.put_chunk(id, index, chunk.clone());
        Ok(chunk)
    }

    /// Assembles the full body from its chunks, in index order.
    pub fn read_body(&self, id: MessageId) -> MessageResult<Bytes> {
        let count = self.chunk_count(id)?;
        if count == 1 {
            return Ok(self.chunk(id, 0usize)?.payload().clone());
        }

        let mut body = BytesMut::new();
        for index in 0..count {
            body.extend_from_slice(self.chunk(id, index)?.payload());
        }
        Ok(body.freeze())
    }

    // ========================================================================
    // Reception
    // ========================================================================

    /// Appends the next body chunk and persists it under `ctx`.
    ///
    /// The chunk is stored at index `len - 1` of the grown sequence. Fails
    /// with `InvalidState` once the message is complete. If the store write
    /// fails the chunk is not counted.
    pub fn add_chunk(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        chunk: ContentChunk,
    ) -> MessageResult<()> {
        let mut state = self.state.write();
        if state.phase == ReceptionPhase::Complete {
            tracing::warn!(message_id = %id, "rejected chunk for complete message");
            return Err(MessageError::InvalidState(format!(
                "message {id} is complete; no more chunks can be added"
            )));
        }

        let index = state.chunk_count.unwrap_or(0);
        self.store.store_content_chunk(ctx, id, index, &chunk)?;

        state.chunk_count = Some(index + 1);
        state.phase = ReceptionPhase::Receiving;
        self.note_write(&mut state, ctx);
        self.cache.put_chunk(id, index, Arc::new(chunk));

        tracing::trace!(message_id = %id, index, context = %ctx, "chunk stored");
        Ok(())
    }

    /// Completes reception: persists the metadata record with the number of
    /// chunks received so far and primes the header and publish slots with
    /// the supplied values.
    ///
    /// Finalizing twice fails with `InvalidState`.
    pub fn finalize(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        publish: PublishDescriptor,
        header: ContentHeader,
    ) -> MessageResult<()> {
        let mut state = self.state.write();
        if state.phase == ReceptionPhase::Complete {
            tracing::warn!(message_id = %id, "rejected second finalize");
            return Err(MessageError::InvalidState(format!(
                "message {id} is already complete"
            )));
        }

        let chunk_count = state.chunk_count.unwrap_or(0);
        let meta = MessageMetaData::new(header, publish, chunk_count);
        self.store.store_message_meta_data(ctx, id, &meta)?;

        state.phase = ReceptionPhase::Complete;
        state.chunk_count = Some(chunk_count);
        self.note_write(&mut state, ctx);
        drop(state);

        self.cache.put_header(id, Arc::new(meta.header));
        self.cache.put_publish(id, Arc::new(meta.publish));

        tracing::info!(message_id = %id, chunk_count, context = %ctx, "message reception complete");
        Ok(())
    }

    // ========================================================================
    // Delivery state
    // ========================================================================

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::SeqCst)
    }

    pub fn set_redelivered(&self, redelivered: bool) {
        self.redelivered.store(redelivered, Ordering::SeqCst);
    }

    // ========================================================================
    // Store pass-through
    // ========================================================================

    /// Erases the message from the store. Cached slots are left alone; the
    /// caller discards the handle.
    pub fn remove(&self, ctx: &StoreContext, id: MessageId) -> MessageResult<()> {
        self.store.remove_message(ctx, id)?;
        tracing::info!(message_id = %id, context = %ctx, "message removed from store");
        Ok(())
    }

    /// Records the message as a member of `queue`.
    pub fn enqueue(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        queue: &QueueName,
    ) -> MessageResult<()> {
        self.store.enqueue_message(ctx, queue, id)?;
        tracing::debug!(message_id = %id, queue = %queue, "message enqueued");
        Ok(())
    }

    /// Removes the message from `queue`.
    pub fn dequeue(
        &self,
        ctx: &StoreContext,
        id: MessageId,
        queue: &QueueName,
    ) -> MessageResult<()> {
        self.store.dequeue_message(ctx, queue, id)?;
        tracing::debug!(message_id = %id, queue = %queue, "message dequeued");
        Ok(())
    }
}

impl<S: MessageStore> std::fmt::Debug for MessageHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MessageHandle")
            .field("phase", &state.phase)
            .field("chunk_count", &state.chunk_count)
            .field("redelivered", &self.is_redelivered())
            .finish()
    }
}
