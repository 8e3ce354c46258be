//! Queue membership and redelivery tests.

use super::{cache, memory_store, receive};
use crate::sqlite::SqliteMessageStore;
use crate::store::{MessageStore, StoreContext};
use crate::types::QueueName;
use std::sync::Arc;

#[test]
fn enqueue_records_membership_on_each_queue() {
    let store = memory_store();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache(), &ctx, &[b"fanout"]);
    let queues = [QueueName::from("a"), QueueName::from("b"), QueueName::from("c")];

    for queue in &queues {
        handle.enqueue(&ctx, id, queue).unwrap();
    }

    for queue in &queues {
        assert_eq!(store.queue_messages(queue).unwrap(), vec![id]);
    }
}

#[test]
fn dequeue_affects_only_the_named_queue() {
    let store = memory_store();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache(), &ctx, &[b"x"]);
    let (a, b) = (QueueName::from("a"), QueueName::from("b"));
    handle.enqueue(&ctx, id, &a).unwrap();
    handle.enqueue(&ctx, id, &b).unwrap();

    handle.dequeue(&ctx, id, &a).unwrap();

    assert!(store.queue_messages(&a).unwrap().is_empty());
    assert_eq!(store.queue_messages(&b).unwrap(), vec![id]);
    assert!(store.contains_message(id));
}

#[test]
fn dequeue_of_a_message_not_on_the_queue_succeeds() {
    let store = memory_store();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache(), &ctx, &[b"x"]);

    handle.dequeue(&ctx, id, &QueueName::from("never")).unwrap();
}

#[test]
fn queue_members_are_listed_in_id_order() {
    let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
    let cache = cache();
    let ctx = StoreContext::new("test");
    let queue = QueueName::from("work");

    let mut ids = Vec::new();
    for body in [&b"1"[..], b"2", b"3"] {
        let (id, handle) = receive(&store, &cache, &ctx, &[body]);
        ids.push((id, handle));
    }
    for (id, handle) in ids.iter().rev() {
        handle.enqueue(&ctx, *id, &queue).unwrap();
    }

    let expected: Vec<_> = ids.iter().map(|(id, _)| *id).collect();
    assert_eq!(store.queue_messages(&queue).unwrap(), expected);

    let (middle, handle) = &ids[1];
    handle.dequeue(&ctx, *middle, &queue).unwrap();
    assert_eq!(store.queue_messages(&queue).unwrap(), vec![expected[0], expected[2]]);
}

#[test]
fn redelivered_flag_defaults_to_false_and_toggles() {
    let store = memory_store();
    let ctx = StoreContext::new("test");
    let (_, handle) = receive(&store, &cache(), &ctx, &[b"x"]);

    assert!(!handle.is_redelivered());
    handle.set_redelivered(true);
    assert!(handle.is_redelivered());
    handle.set_redelivered(false);
    assert!(!handle.is_redelivered());
}

#[test]
fn redelivered_flag_is_not_persisted() {
    let store = memory_store();
    let cache = cache();
    let ctx = StoreContext::new("test");
    let (id, handle) = receive(&store, &cache, &ctx, &[b"x"]);
    handle.set_redelivered(true);

    let fresh = crate::handle::MessageHandle::new(store.clone(), cache.clone());
    fresh.header(id).unwrap();
    assert!(!fresh.is_redelivered());
}
