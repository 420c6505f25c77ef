//! Chunk content, load state machine and render items

pub mod instance;
pub mod catalog;
pub mod render;
pub mod state;

pub use instance::{INSTANCE_RECORD_SIZE, PlacedInstance, decode_payload, encode_payload};
pub use catalog::PartCatalog;
pub use render::{RenderArena, RenderHandle, RenderItem};
pub use state::{COLLISION_EPSILON, Chunk, ChunkDistances, ChunkHit, LoadContext, ReadyState};
