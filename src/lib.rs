//! Brickstream - octree chunk streaming for brick-built worlds

pub mod core;
pub mod math;
pub mod octree;
pub mod chunk;
pub mod store;
pub mod streaming;
