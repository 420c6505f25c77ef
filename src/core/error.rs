//! Error types for brickstream

use thiserror::Error;

use crate::octree::OctreeAddress;

/// Main error type for the streaming core
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] brickstream_net::TransportError),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Store server failed the request: {0}")]
    Remote(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Chunk {0:?} is not resident")]
    ChunkNotResident(OctreeAddress),

    #[error("Chunk {0:?} is not ready")]
    ChunkNotReady(OctreeAddress),

    #[error("Position outside the world: {0}")]
    OutOfWorld(glam::Vec3),
}
