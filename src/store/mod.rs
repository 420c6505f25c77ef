//! Persistent chunk store: the shared contract and its server and client
//! implementations.
//!
//! The server variant ([`ServerStore`]) owns the durable database and is
//! exposed over the network by [`StoreService`]. The client variant
//! ([`ClientStore`]) forwards reads and writes across the transport and
//! caches completed reads. Either can back a [`crate::streaming::Selection`].

pub mod compression;
pub mod filter;
pub mod cache;
pub mod server;
pub mod client;

pub use cache::CompletedCache;
pub use client::ClientStore;
pub use compression::CompressionFormat;
pub use filter::MembershipFilter;
pub use server::{ServerStore, StoreService};

use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::octree::OctreeAddress;

/// Outcome of a chunk read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkFetch {
    /// Requested but not answered yet; ask again later
    Pending,
    /// Nothing stored under this address (not generated yet)
    Absent,
    /// Stored payload
    Found(Vec<u8>),
}

impl ChunkFetch {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Session-resume data kept under the reserved player key
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub position: [f32; 3],
    pub held_item: Option<u32>,
    pub inventory: Vec<u32>,
}

/// Key-value contract over octree addresses.
///
/// Reads never block on the network: a client answers
/// [`ChunkFetch::Pending`] until its response has arrived. Writes return
/// once the store has acknowledged them.
pub trait ChunkStore: Send + Sync {
    fn get_chunk(&self, address: OctreeAddress) -> Result<ChunkFetch>;

    /// Read several chunks at once, one result per address
    fn get_chunks(&self, addresses: &[OctreeAddress]) -> Vec<Result<ChunkFetch>> {
        addresses.iter().map(|address| self.get_chunk(*address)).collect()
    }

    fn write_chunk(&self, address: OctreeAddress, payload: &[u8]) -> Result<()>;

    fn get_player_state(&self) -> Result<Option<PlayerState>>;

    fn write_player_state(&self, state: &PlayerState) -> Result<()>;
}
