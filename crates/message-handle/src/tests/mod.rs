//! Integration tests for message handles.
//!
//! - `roundtrip.rs`    - Stored content reads back unchanged
//! - `caching.rs`      - Cache transparency, co-caching and fetch granularity
//! - `reception.rs`    - Reception state machine and chunk bounds
//! - `persistence.rs`  - Delivery-mode persistence predicate
//! - `queues.rs`       - Queue membership and the redelivered flag
//! - `transactions.rs` - Staged mutations under a store context
//! - `durability.rs`   - SQLite reopen and fresh-handle rehydration
//! - `concurrency.rs`  - Concurrent readers racing on reclaimed slots
//! - `failures.rs`     - Store failure propagation

mod caching;
mod queues;

use std::sync::Arc;

use crate::cache::ReclaimableCache;
use crate::handle::MessageHandle;
use crate::memory::MemoryMessageStore;
use crate::store::{MessageStore, StoreContext};
use crate::types::{
    BasicProperties, ContentChunk, ContentHeader, DeliveryMode, MessageId, PublishDescriptor,
    QueueName,
};

pub(crate) fn cache() -> Arc<ReclaimableCache> {
    Arc::new(ReclaimableCache::with_capacity(1024, 16 << 20))
}

pub(crate) fn memory_store() -> Arc<MemoryMessageStore> {
    Arc::new(MemoryMessageStore::new())
}

pub(crate) fn header(body: &[&[u8]], delivery_mode: u8) -> ContentHeader {
    let size = body.iter().map(|c| c.len() as u64).sum();
    ContentHeader::basic(size, BasicProperties::with_delivery_mode(delivery_mode))
}

pub(crate) fn publish() -> PublishDescriptor {
    PublishDescriptor::new("amq.direct", "orders")
}

/// Receives a complete message through a fresh handle and returns both.
pub(crate) fn receive<S: MessageStore>(
    store: &Arc<S>,
    cache: &Arc<ReclaimableCache>,
    ctx: &StoreContext,
    body: &[&[u8]],
) -> (MessageId, MessageHandle<S>) {
    let id = store.new_message_id();
    let handle = MessageHandle::new(store.clone(), cache.clone());
    for chunk in body {
        handle
            .add_chunk(ctx, id, ContentChunk::new(chunk.to_vec()))
            .unwrap();
    }
    handle
        .finalize(ctx, id, publish(), header(body, DeliveryMode::PERSISTENT))
        .unwrap();
    (id, handle)
}

/// Full reception workflow: receive, enqueue, deliver, acknowledge.
#[test]
fn basic_workflow() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("publisher");
    let queue = QueueName::from("orders");

    let (id, handle) = receive(&store, &cache, &ctx, &[b"order ", b"#42"]);
    handle.enqueue(&ctx, id, &queue).unwrap();

    assert_eq!(store.queue_messages(&queue).unwrap(), vec![id]);
    assert_eq!(handle.publish_descriptor(id).unwrap().routing_key, "orders");
    assert_eq!(handle.read_body(id).unwrap().as_ref(), b"order #42");
    assert!(handle.is_persistent(id).unwrap());

    handle.dequeue(&ctx, id, &queue).unwrap();
    handle.remove(&ctx, id).unwrap();
    assert!(store.queue_messages(&queue).unwrap().is_empty());
    assert!(!store.contains_message(id));
}
