//! A minimal stand-in for a DHT peer-discovery collaborator.
//!
//! Full Kademlia routing is out of scope for this crate; what's needed is
//! the narrow contract the rest of the engine depends on (insert a peer
//! contact, look one up, drop one) plus the one routing detail callers
//! actually rely on: a bucket's eviction behaviour when it's full. That
//! behaviour is implemented here as [`KBucket`] and exercised by
//! [`NullDhtHandle`], an in-memory stand-in used wherever the engine needs
//! *some* [`DhtHandle`] to be wired in without a real DHT implementation
//! behind it.

use std::net::SocketAddr;

use crate::PeerId;

/// The contract a DHT implementation must offer the engine.
///
/// None of the methods are async in this minimal contract: a real
/// implementation backed by network I/O would make them `async fn`, but
/// since no routing logic actually runs over the network here, the
/// trait stays synchronous.
pub trait DhtHandle: Send + Sync {
    /// Inserts or refreshes a peer contact learned from the swarm.
    fn insert(&mut self, id: PeerId, addr: SocketAddr);

    /// Removes a peer contact, e.g. after it disconnects.
    fn delete(&mut self, id: &PeerId);

    /// Looks up a previously inserted peer's address.
    fn lookup(&self, id: &PeerId) -> Option<SocketAddr>;
}

/// A single fixed-capacity Kademlia bucket.
///
/// Ordered oldest-seen (head) to most-recently-seen (tail), the way a real
/// routing table bucket would be, but with no notion of bucket depth or
/// XOR distance: just the eviction rule in isolation.
#[derive(Debug, Default)]
pub struct KBucket {
    capacity: usize,
    entries: Vec<(PeerId, SocketAddr)>,
}

/// The outcome of inserting into a full bucket.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was new and the bucket had room for it.
    Inserted,
    /// The entry was already present; it was moved to the tail and no ping
    /// was issued.
    Refreshed,
    /// The bucket was full of entries other than this one. The
    /// least-recently-seen entry (the head) should be pinged; if it
    /// responds, this insertion is dropped, otherwise it should be evicted
    /// and this entry inserted in its place.
    PingLeastRecentlySeen { evict_candidate: PeerId },
}

impl KBucket {
    /// Creates an empty bucket that holds at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attempts to insert or refresh `id`.
    ///
    /// If `id` is already present, it's moved to the tail (marked most
    /// recently seen) and the ping is skipped. Otherwise, if the bucket has
    /// room, the entry is appended. Otherwise, the caller is told to ping
    /// the head (the least-recently-seen entry) and evict it in favor of
    /// this entry only if that ping fails; this function does not perform
    /// the eviction itself, since that requires the ping's outcome.
    pub fn insert(&mut self, id: PeerId, addr: SocketAddr) -> InsertOutcome {
        if let Some(pos) = self.entries.iter().position(|(e, _)| *e == id) {
            let entry = self.entries.remove(pos);
            self.entries.push(entry);
            return InsertOutcome::Refreshed;
        }

        if self.entries.len() < self.capacity {
            self.entries.push((id, addr));
            return InsertOutcome::Inserted;
        }

        InsertOutcome::PingLeastRecentlySeen {
            evict_candidate: self.entries[0].0,
        }
    }

    /// Evicts the least-recently-seen entry (the head) and inserts `id` in
    /// its place, as the tail. Called after a
    /// [`InsertOutcome::PingLeastRecentlySeen`] ping has failed.
    ///
    /// # Panics
    ///
    /// Panics if the bucket is empty.
    pub fn evict_head_and_insert(&mut self, id: PeerId, addr: SocketAddr) {
        assert!(!self.entries.is_empty(), "cannot evict from an empty bucket");
        self.entries.remove(0);
        self.entries.push((id, addr));
    }
}

/// A no-op [`DhtHandle`] backed by an in-memory map, with no routing,
/// bucketing, or network activity of its own. Useful for driving the engine
/// in tests, or for embedders that don't want DHT-assisted peer discovery.
#[derive(Debug, Default)]
pub struct NullDhtHandle {
    contacts: std::collections::HashMap<PeerId, SocketAddr>,
}

impl NullDhtHandle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DhtHandle for NullDhtHandle {
    fn insert(&mut self, id: PeerId, addr: SocketAddr) {
        self.contacts.insert(id, addr);
    }

    fn delete(&mut self, id: &PeerId) {
        self.contacts.remove(id);
    }

    fn lookup(&self, id: &PeerId) -> Option<SocketAddr> {
        self.contacts.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn id(byte: u8) -> PeerId {
        [byte; 20]
    }

    #[test]
    fn inserting_into_a_bucket_with_room_succeeds() {
        let mut bucket = KBucket::new(2);
        assert_eq!(bucket.insert(id(1), addr(1)), InsertOutcome::Inserted);
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn reinserting_an_existing_entry_refreshes_it_instead_of_pinging() {
        let mut bucket = KBucket::new(2);
        bucket.insert(id(1), addr(1));
        bucket.insert(id(2), addr(2));
        let outcome = bucket.insert(id(1), addr(1));
        assert_eq!(outcome, InsertOutcome::Refreshed);
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn full_bucket_asks_to_ping_the_least_recently_seen_entry() {
        let mut bucket = KBucket::new(2);
        bucket.insert(id(1), addr(1));
        bucket.insert(id(2), addr(2));
        let outcome = bucket.insert(id(3), addr(3));
        assert_eq!(
            outcome,
            InsertOutcome::PingLeastRecentlySeen {
                evict_candidate: id(1)
            }
        );
    }

    #[test]
    fn eviction_replaces_the_head_and_moves_new_entry_to_tail() {
        let mut bucket = KBucket::new(2);
        bucket.insert(id(1), addr(1));
        bucket.insert(id(2), addr(2));
        bucket.evict_head_and_insert(id(3), addr(3));
        assert_eq!(bucket.len(), 2);
        // id(1) was evicted; refreshing id(2) should move it to the tail,
        // leaving id(3) as the new least-recently-seen head.
        bucket.insert(id(2), addr(2));
        let outcome = bucket.insert(id(4), addr(4));
        assert_eq!(
            outcome,
            InsertOutcome::PingLeastRecentlySeen {
                evict_candidate: id(3)
            }
        );
    }

    #[test]
    fn null_dht_handle_round_trips_contacts() {
        let mut dht = NullDhtHandle::new();
        dht.insert(id(1), addr(1));
        assert_eq!(dht.lookup(&id(1)), Some(addr(1)));
        dht.delete(&id(1));
        assert_eq!(dht.lookup(&id(1)), None);
    }
}
