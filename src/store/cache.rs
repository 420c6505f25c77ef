//! LRU cache of completed chunk reads
//!
//! Holds the answers the store client has already received, so repeated
//! reads of the same address do not go back over the network. When the
//! cache is full, the least recently used answer is evicted.

use std::collections::HashMap;

use crate::octree::OctreeAddress;

/// LRU cache of completed reads
///
/// A cached `None` records that the store has nothing under the address.
pub struct CompletedCache {
    /// Map of addresses to payloads
    entries: HashMap<OctreeAddress, Option<Vec<u8>>>,
    /// Access order: oldest first, newest last
    /// When an entry is accessed, it's moved to the end
    access_order: Vec<OctreeAddress>,
    /// Maximum number of entries to keep
    capacity: usize,
}

impl CompletedCache {
    /// Create a new cache with the given capacity
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of entries kept (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            access_order: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Get a cached answer
    ///
    /// Updates the access order to mark this entry as recently used.
    ///
    /// # Returns
    /// `None` if the address is not cached, `Some(None)` if it is cached as absent
    pub fn get(&mut self, address: OctreeAddress) -> Option<Option<Vec<u8>>> {
        let value = self.entries.get(&address)?.clone();
        self.touch(address);
        Some(value)
    }

    /// Insert or replace an answer
    ///
    /// If the cache is at capacity, the least recently used entry is evicted first.
    ///
    /// # Returns
    /// The address evicted to make space, if any
    pub fn insert(&mut self, address: OctreeAddress, value: Option<Vec<u8>>) -> Option<OctreeAddress> {
        if self.entries.insert(address, value).is_some() {
            self.touch(address);
            return None;
        }
        self.access_order.push(address);

        if self.entries.len() > self.capacity {
            let oldest = self.access_order.remove(0);
            self.entries.remove(&oldest);
            return Some(oldest);
        }
        None
    }

    /// Check if an address is cached
    pub fn contains(&self, address: OctreeAddress) -> bool {
        self.entries.contains_key(&address)
    }

    /// Get the number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn touch(&mut self, address: OctreeAddress) {
        if let Some(pos) = self.access_order.iter().position(|a| *a == address) {
            self.access_order.remove(pos);
        }
        self.access_order.push(address);
    }
}
