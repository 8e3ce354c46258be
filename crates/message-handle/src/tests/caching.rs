//! Caching tests.
//!
//! Covers:
//! - Reclaimed slots are refetched transparently
//! - Header and publish descriptor are repopulated together
//! - The chunk count is fetched at most once
//! - A chunk miss fetches exactly that chunk
//! - Bounded caches evict without affecting reads

use std::sync::Arc;

use super::{cache, memory_store, publish, receive};
use crate::cache::{ReclaimableCache, Slot};
use crate::handle::MessageHandle;
use crate::store::StoreContext;

#[test]
fn reclaimed_header_is_refetched_transparently() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache, &ctx, &[b"abc"]);

    let before = handle.header(id).unwrap();
    assert!(cache.reclaim(id, Slot::Header));
    store.reset_read_counts();

    let after = handle.header(id).unwrap();
    assert_eq!(before, after);
    assert_eq!(store.metadata_reads(), 1);
    assert!(cache.contains(id, Slot::Header));
}

#[test]
fn header_miss_repopulates_publish_descriptor() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache, &ctx, &[b"abc"]);

    cache.reclaim(id, Slot::Header);
    cache.reclaim(id, Slot::Publish);
    store.reset_read_counts();

    handle.header(id).unwrap();
    assert!(cache.contains(id, Slot::Publish));
    assert_eq!(*handle.publish_descriptor(id).unwrap(), publish());
    assert_eq!(store.metadata_reads(), 1);
}

#[test]
fn publish_miss_repopulates_header() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache, &ctx, &[b"abc"]);

    cache.reclaim_message(id);
    store.reset_read_counts();

    handle.publish_descriptor(id).unwrap();
    assert!(cache.contains(id, Slot::Header));
    assert_eq!(handle.body_size(id).unwrap(), 3);
    assert_eq!(store.metadata_reads(), 1);
}

#[test]
fn cached_reads_do_not_touch_the_store() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache, &ctx, &[b"a", b"b"]);

    for _ in 0..10 {
        handle.header(id).unwrap();
        handle.publish_descriptor(id).unwrap();
        handle.chunk(id, 0usize).unwrap();
        handle.chunk(id, 1usize).unwrap();
    }

    assert_eq!(store.metadata_reads(), 0);
    assert_eq!(store.chunk_reads(), 0);
    assert!(cache.stats().hits >= 40);
}

#[test]
fn chunk_count_is_fetched_at_most_once_on_a_fresh_handle() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, _) = receive(&store, &cache, &ctx, &[b"a", b"b", b"c"]);

    cache.clear();
    store.reset_read_counts();
    let fresh = MessageHandle::new(store.clone(), cache.clone());

    assert_eq!(fresh.chunk_count(id).unwrap(), 3);
    cache.clear();
    assert_eq!(fresh.chunk_count(id).unwrap(), 3);
    fresh.chunk(id, 2usize).unwrap();

    assert_eq!(store.metadata_reads(), 1);
}

#[test]
fn chunk_miss_fetches_only_that_chunk() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache, &ctx, &[b"zero", b"one", b"two", b"three"]);

    cache.reclaim_message(id);
    store.reset_read_counts();

    assert_eq!(handle.chunk(id, 2usize).unwrap().payload().as_ref(), b"two");
    assert_eq!(store.chunk_reads(), 1);
    assert_eq!(store.metadata_reads(), 0);
    assert!(cache.contains(id, Slot::Chunk(2)));
    assert!(!cache.contains(id, Slot::Chunk(0)));
    assert!(!cache.contains(id, Slot::Chunk(1)));
    assert!(!cache.contains(id, Slot::Chunk(3)));
    assert!(!cache.contains(id, Slot::Header));
}

#[test]
fn fresh_handle_learns_everything_from_the_store() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, original) = receive(&store, &cache, &ctx, &[b"hello ", b"again"]);
    let expected_header = original.header(id).unwrap();
    drop(original);
    cache.clear();

    let fresh = MessageHandle::new(store.clone(), cache.clone());
    assert_eq!(fresh.header(id).unwrap(), expected_header);
    assert_eq!(fresh.chunk_count(id).unwrap(), 2);
    assert_eq!(fresh.read_body(id).unwrap().as_ref(), b"hello again");
}

#[test]
fn tiny_cache_evicts_but_reads_stay_correct() {
    let store = memory_store();
    let cache = Arc::new(ReclaimableCache::with_capacity(2, 1 << 20));
    let ctx = StoreContext::new("test");
    let body: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 32]).collect();
    let slices: Vec<&[u8]> = body.iter().map(Vec::as_slice).collect();

    let (id, handle) = receive(&store, &cache, &ctx, &slices);
    assert!(cache.len() <= 2);

    for (index, expected) in body.iter().enumerate() {
        assert_eq!(handle.chunk(id, index).unwrap().payload().as_ref(), expected.as_slice());
        assert_eq!(handle.header(id).unwrap().body_size, 16 * 32);
    }
    assert!(cache.len() <= 2);
    assert!(cache.stats().evictions > 0);
}

#[test]
fn byte_bound_rejects_oversized_chunks_without_breaking_reads() {
    let store = memory_store();
    let cache = Arc::new(ReclaimableCache::with_capacity(64, 256));
    let ctx = StoreContext::new("test");
    let big = vec![7u8; 1024];

    let (id, handle) = receive(&store, &cache, &ctx, &[big.as_slice()]);
    assert!(!cache.contains(id, Slot::Chunk(0)));

    store.reset_read_counts();
    assert_eq!(handle.read_body(id).unwrap().len(), 1024);
    assert_eq!(store.chunk_reads(), 1);
    assert!(cache.stats().bytes <= 256);
}

#[test]
fn messages_do_not_share_slots() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (first, first_handle) = receive(&store, &cache, &ctx, &[b"first"]);
    let (second, second_handle) = receive(&store, &cache, &ctx, &[b"second"]);

    cache.reclaim_message(first);

    assert!(cache.contains(second, Slot::Chunk(0)));
    assert_eq!(first_handle.read_body(first).unwrap().as_ref(), b"first");
    assert_eq!(second_handle.read_body(second).unwrap().as_ref(), b"second");
}
