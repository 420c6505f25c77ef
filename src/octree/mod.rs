//! World octree addressing and store keys

pub mod address;
pub mod key;

pub use address::{ADDRESS_BITS, MAX_LEVEL, OctreeAddress, WORLD_ORIGIN, WORLD_SIZE};
pub use key::{KeyKind, PersistenceKey};
