//! Chunk streaming: LOD selection, background loading and the resident set

pub mod lod;
pub mod loader;
pub mod selection;

pub use lod::{LodStats, LodView, MIN_LOD_DISTANCE, select_nodes, target_level};
pub use loader::{ChunkLoader, SharedChunk, lock_chunk};
pub use selection::{RayHit, RenderChunk, RenderSet, Selection, SelectionStats};
