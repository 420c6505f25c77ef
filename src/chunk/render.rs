//! Arena of renderable items.
//!
//! Items are stored flat and addressed by [`RenderHandle`]. Each item keeps
//! the address of the chunk that produced it as a plain value, so tearing a
//! chunk down is a pass over its handle list.

use slab::Slab;

use crate::core::types::Mat4;
use crate::octree::OctreeAddress;

/// Index of an item in a [`RenderArena`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderHandle(usize);

/// One drawable part
#[derive(Clone, Debug, PartialEq)]
pub struct RenderItem {
    /// Chunk that owns this item
    pub chunk: OctreeAddress,
    /// Index into the owning chunk's instance list
    pub instance: usize,
    pub part_type: u32,
    pub palette: u32,
    /// World transform
    pub transform: Mat4,
}

#[derive(Default)]
pub struct RenderArena {
    items: Slab<RenderItem>,
}

impl RenderArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: RenderItem) -> RenderHandle {
        RenderHandle(self.items.insert(item))
    }

    /// Remove an item; stale handles are ignored
    pub fn remove(&mut self, handle: RenderHandle) -> Option<RenderItem> {
        self.items.try_remove(handle.0)
    }

    pub fn get(&self, handle: RenderHandle) -> Option<&RenderItem> {
        self.items.get(handle.0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RenderHandle, &RenderItem)> {
        self.items.iter().map(|(key, item)| (RenderHandle(key), item))
    }
}
