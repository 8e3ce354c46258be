//! MessageId-indexed arena of message handles.
//!
//! The registry owns one [`MessageHandle`] per live message and hands out
//! shared references to it. Handles never point at each other; everything is
//! looked up by [`MessageId`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::ReclaimableCache;
use crate::handle::MessageHandle;
use crate::store::{MessageStore, StoreContext};
use crate::types::MessageId;
use crate::{MessageError, MessageResult};

/// Live handles sharing one store and one cache.
pub struct MessageRegistry<S: MessageStore> {
    store: Arc<S>,
    cache: Arc<ReclaimableCache>,
    handles: RwLock<HashMap<MessageId, Arc<MessageHandle<S>>>>,
}

impl<S: MessageStore> MessageRegistry<S> {
    pub fn new(store: Arc<S>, cache: Arc<ReclaimableCache>) -> Self {
        Self {
            store,
            cache,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ReclaimableCache> {
        &self.cache
    }

    /// Registers a fresh handle for a message about to be received.
    ///
    /// Fails with `InvalidState` if `id` already has a handle.
    pub fn create(&self, id: MessageId) -> MessageResult<Arc<MessageHandle<S>>> {
        let mut handles = self.handles.write();
        if handles.contains_key(&id) {
            return Err(MessageError::InvalidState(format!(
                "message {id} already has a handle"
            )));
        }
        let handle = Arc::new(MessageHandle::new(self.store.clone(), self.cache.clone()));
        handles.insert(id, handle.clone());
        tracing::debug!(message_id = %id, "registry: handle created");
        Ok(handle)
    }

    /// Returns the handle for `id`, creating one over the stored message if
    /// none is registered.
    ///
    /// The message must already exist in the store; `NotFound` otherwise.
    pub fn open(&self, id: MessageId) -> MessageResult<Arc<MessageHandle<S>>> {
        if let Some(handle) = self.get(id) {
            return Ok(handle);
        }

        let handle = Arc::new(MessageHandle::new(self.store.clone(), self.cache.clone()));
        handle.header(id)?;

        let mut handles = self.handles.write();
        let handle = handles.entry(id).or_insert(handle).clone();
        tracing::debug!(message_id = %id, "registry: handle opened from store");
        Ok(handle)
    }

    pub fn get(&self, id: MessageId) -> Option<Arc<MessageHandle<S>>> {
        self.handles.read().get(&id).cloned()
    }

    /// Removes the message from the store, through its handle when one is
    /// registered, then drops the handle and every cached slot. If the store
    /// removal fails nothing is dropped.
    pub fn remove(&self, ctx: &StoreContext, id: MessageId) -> MessageResult<()> {
        match self.get(id) {
            Some(handle) => handle.remove(ctx, id)?,
            None => self.store.remove_message(ctx, id)?,
        }
        self.discard(id);
        tracing::info!(message_id = %id, context = %ctx, "registry: message removed");
        Ok(())
    }

    /// Drops the handle and cached slots of `id` without touching the store.
    ///
    /// Returns true if a handle was registered.
    pub fn discard(&self, id: MessageId) -> bool {
        let existed = self.handles.write().remove(&id).is_some();
        let reclaimed = self.cache.reclaim_message(id);
        tracing::trace!(message_id = %id, existed, reclaimed, "registry: handle discarded");
        existed
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        self.store.begin_tran(ctx)
    }

    /// Commits the transaction of `ctx` and settles the handles written under
    /// it. If the commit fails those handles are discarded, since the store
    /// kept none of their writes.
    pub fn commit_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        if let Err(err) = self.store.commit_tran(ctx) {
            self.discard_staged_under(ctx);
            return Err(err);
        }
        for handle in self.handles.read().values() {
            handle.settle(ctx.id());
        }
        Ok(())
    }

    /// Aborts the transaction of `ctx` and discards every handle written
    /// under it, along with its cached slots.
    pub fn abort_tran(&self, ctx: &StoreContext) -> MessageResult<()> {
        self.store.abort_tran(ctx)?;
        let discarded = self.discard_staged_under(ctx);
        tracing::debug!(context = %ctx, discarded, "registry: transaction aborted");
        Ok(())
    }

    fn discard_staged_under(&self, ctx: &StoreContext) -> usize {
        let touched: Vec<MessageId> = self
            .handles
            .read()
            .iter()
            .filter(|(_, handle)| handle.staged_under() == Some(ctx.id()))
            .map(|(id, _)| *id)
            .collect();
        for id in &touched {
            self.discard(*id);
        }
        touched.len()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl<S: MessageStore> std::fmt::Debug for MessageRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("handles", &self.len())
            .field("cache", &self.cache.stats())
            .finish()
    }
}
