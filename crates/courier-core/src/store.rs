//! Bounded per-topic message store.
//!
//! Each topic keeps its most recent messages in a fixed-size ring. Ids start
//! at 1 and increase by one per append; once the ring is full the oldest
//! message is overwritten and the retained window moves forward.

use crate::message::{Message, MessageId};
use parking_lot::RwLock;
use std::sync::Arc;

/// Default number of messages retained per topic.
pub const DEFAULT_STORE_CAPACITY: usize = 5000;

/// Result of a range read from a [`MessageStore`].
#[derive(Debug, Clone, Default)]
pub struct StoreRead {
    /// Id of the first returned message, or the next id to be assigned when
    /// nothing was returned.
    pub first_id: MessageId,
    /// Messages in increasing id order, contiguous from `first_id`.
    pub messages: Vec<Arc<Message>>,
    /// Whether unread messages remain past the returned batch.
    pub has_more: bool,
}

impl StoreRead {
    /// An empty read positioned at `first_id`.
    #[must_use]
    pub fn empty(first_id: MessageId) -> Self {
        Self {
            first_id,
            messages: Vec::new(),
            has_more: false,
        }
    }

    /// Number of returned messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing was returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Id of the last message covered by this read.
    ///
    /// This is where a reader's cursor moves to after consuming the batch.
    #[must_use]
    pub fn last_id(&self) -> MessageId {
        (self.first_id + self.messages.len() as u64).saturating_sub(1)
    }

    /// Number of ids skipped between `since_id` and the first returned message.
    ///
    /// Non-zero means the reader's position fell out of the retained window
    /// and those messages are lost to it.
    #[must_use]
    pub fn missed(&self, since_id: MessageId) -> u64 {
        if self.messages.is_empty() {
            return 0;
        }
        self.first_id.saturating_sub(since_id.saturating_add(1))
    }
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Arc<Message>>>,
    next_id: MessageId,
    min_id: MessageId,
}

/// Fixed-capacity ring of messages with monotonic ids.
///
/// Reads take a shared lock and never block each other; an append takes the
/// exclusive lock, so a reader that observes id `N` has observed every id
/// below it.
#[derive(Debug)]
pub struct MessageStore {
    capacity: usize,
    ring: RwLock<Ring>,
}

impl MessageStore {
    /// Create a store retaining at most `capacity` messages (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: RwLock::new(Ring {
                slots: vec![None; capacity],
                next_id: 1,
                min_id: 1,
            }),
        }
    }

    /// Maximum number of retained messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Id of the most recently appended message, or 0 if none.
    #[must_use]
    pub fn last_id(&self) -> MessageId {
        self.ring.read().next_id - 1
    }

    /// Total number of messages ever appended.
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.last_id()
    }

    /// Lowest id still retained.
    #[must_use]
    pub fn min_message_id(&self) -> MessageId {
        self.ring.read().min_id
    }

    /// Whether the ring has wrapped and dropped messages.
    #[must_use]
    pub fn has_overflowed(&self) -> bool {
        self.ring.read().min_id > 1
    }

    fn slot(&self, id: MessageId) -> usize {
        (id % self.capacity as u64) as usize
    }

    /// Append a message and return its assigned id.
    pub fn add(&self, message: Message) -> MessageId {
        let mut ring = self.ring.write();
        let id = ring.next_id;
        ring.next_id += 1;

        let capacity = self.capacity as u64;
        if id > capacity {
            ring.min_id = id - capacity + 1;
        }

        let slot = self.slot(id);
        ring.slots[slot] = Some(Arc::new(message.stamped(id)));
        id
    }

    /// Read up to `max` messages following `since_id`.
    ///
    /// If `since_id` is older than the retained window the read starts at
    /// the oldest retained message; [`StoreRead::missed`] reports the gap.
    /// A `max` of 0 returns nothing and reports `has_more` when unread
    /// messages exist.
    #[must_use]
    pub fn get_messages(&self, since_id: MessageId, max: usize) -> StoreRead {
        let ring = self.ring.read();
        let last = ring.next_id - 1;

        if since_id >= last {
            return StoreRead::empty(ring.next_id);
        }

        if max == 0 {
            return StoreRead {
                first_id: since_id + 1,
                messages: Vec::new(),
                has_more: true,
            };
        }

        let start = since_id.saturating_add(1).max(ring.min_id);
        let available = last - start + 1;
        let count = available.min(max as u64);

        let messages: Vec<Arc<Message>> = (start..start + count)
            .filter_map(|id| ring.slots[self.slot(id)].clone())
            .collect();
        debug_assert_eq!(messages.len() as u64, count);
        debug_assert!(messages.first().map_or(true, |m| m.id == start));

        StoreRead {
            first_id: start,
            messages,
            has_more: count < available,
        }
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn msg(n: u64) -> Message {
        Message::new("test", "k", format!("m{}", n))
    }

    fn ids(read: &StoreRead) -> Vec<u64> {
        read.messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_ids_start_at_one() {
        let store = MessageStore::new(4);
        assert_eq!(store.last_id(), 0);
        assert_eq!(store.add(msg(1)), 1);
        assert_eq!(store.add(msg(2)), 2);
        assert_eq!(store.message_count(), 2);
        assert!(!store.has_overflowed());
    }

    #[test]
    fn test_empty_store_read() {
        let store = MessageStore::new(4);
        let read = store.get_messages(0, 10);
        assert!(read.is_empty());
        assert_eq!(read.first_id, 1);
        assert_eq!(read.last_id(), 0);
    }

    #[test]
    fn test_caught_up_read() {
        let store = MessageStore::new(8);
        for n in 0..3 {
            store.add(msg(n));
        }

        let read = store.get_messages(3, 10);
        assert!(read.is_empty());
        assert_eq!(read.first_id, 4);
        assert_eq!(read.last_id(), 3);
        assert!(!read.has_more);

        // Ahead of the store is treated as caught up.
        let read = store.get_messages(100, 10);
        assert!(read.is_empty());
        assert_eq!(read.first_id, 4);
    }

    #[test]
    fn test_read_range_with_has_more() {
        let store = MessageStore::new(16);
        for n in 0..10 {
            store.add(msg(n));
        }

        let read = store.get_messages(2, 4);
        assert_eq!(ids(&read), vec![3, 4, 5, 6]);
        assert_eq!(read.first_id, 3);
        assert_eq!(read.last_id(), 6);
        assert!(read.has_more);
        assert_eq!(read.missed(2), 0);

        let read = store.get_messages(6, 4);
        assert_eq!(ids(&read), vec![7, 8, 9, 10]);
        assert!(!read.has_more);
    }

    #[test]
    fn test_zero_max_reads_nothing() {
        let store = MessageStore::new(16);
        for n in 0..5 {
            store.add(msg(n));
        }

        let read = store.get_messages(2, 0);
        assert!(read.is_empty());
        assert!(read.has_more);
        assert_eq!(read.last_id(), 2);
        assert_eq!(read.missed(2), 0);

        let read = store.get_messages(5, 0);
        assert!(read.is_empty());
        assert!(!read.has_more);
    }

    #[test]
    fn test_overflow_returns_retained_window() {
        let store = MessageStore::new(10);
        for n in 0..25 {
            store.add(msg(n));
        }

        assert!(store.has_overflowed());
        assert_eq!(store.min_message_id(), 16);

        let read = store.get_messages(0, 100);
        assert_eq!(read.len(), 10);
        assert_eq!(read.first_id, 16);
        assert_eq!(ids(&read), (16..=25).collect::<Vec<_>>());
        assert_eq!(read.missed(0), 15);
        assert_eq!(read.last_id(), 25);
    }

    #[test]
    fn test_overflow_edge_of_window() {
        let store = MessageStore::new(10);
        for n in 0..25 {
            store.add(msg(n));
        }

        // since_id 15 is exactly one behind the window: nothing missed.
        let read = store.get_messages(15, 100);
        assert_eq!(read.first_id, 16);
        assert_eq!(read.missed(15), 0);

        let read = store.get_messages(14, 100);
        assert_eq!(read.first_id, 16);
        assert_eq!(read.missed(14), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let store = MessageStore::new(0);
        assert_eq!(store.capacity(), 1);
        store.add(msg(1));
        store.add(msg(2));
        let read = store.get_messages(0, 10);
        assert_eq!(ids(&read), vec![2]);
    }

    #[test]
    fn test_payloads_survive_wraparound() {
        let store = MessageStore::new(3);
        for n in 1..=7 {
            store.add(msg(n));
        }
        let read = store.get_messages(4, 10);
        let values: Vec<_> = read.messages.iter().map(|m| m.value.clone()).collect();
        assert_eq!(values, vec!["m5", "m6", "m7"]);
    }

    #[test]
    fn test_concurrent_readers_see_contiguous_prefix() {
        let store = Arc::new(MessageStore::new(64));
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for n in 0..5_000 {
                    store.add(msg(n));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut cursor = 0;
                    while cursor < 5_000 {
                        let read = store.get_messages(cursor, 16);
                        for (offset, m) in read.messages.iter().enumerate() {
                            assert_eq!(m.id, read.first_id + offset as u64);
                            assert!(m.id > cursor);
                        }
                        cursor = read.last_id();
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn test_reads_are_monotonic_and_contiguous(
            capacity in 1usize..32,
            adds in 0u64..100,
            since in 0u64..120,
            max in 1usize..40,
        ) {
            let store = MessageStore::new(capacity);
            for n in 0..adds {
                store.add(msg(n));
            }

            let read = store.get_messages(since, max);
            prop_assert!(read.len() <= max);
            for (offset, m) in read.messages.iter().enumerate() {
                prop_assert!(m.id > since);
                prop_assert_eq!(m.id, read.first_id + offset as u64);
            }
            if let Some(last) = read.messages.last() {
                prop_assert!(last.id <= adds);
                prop_assert!(read.first_id >= store.min_message_id());
            }
        }
    }
}
