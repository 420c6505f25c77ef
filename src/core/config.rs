//! Streaming configuration, loadable from a JSON file

use std::path::{Path, PathBuf};

use brickstream_net::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::store::compression::CompressionFormat;

/// LOD selection parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Octree depth of persisted (leaf) chunks
    pub leaf_level: u8,
    /// Distance at which the target level first drops below the leaf level
    pub lod_base_distance: f32,
    /// Near plane of the LOD frustum
    pub working_near: f32,
    /// Far plane of the LOD frustum
    pub working_far: f32,
    /// Half size of the box around the player that is always kept at full detail
    pub player_half_extent: f32,
    /// Largest level gap over which a coarse chunk aggregates its leaf chunks
    pub max_aggregate_levels: u8,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            leaf_level: 8,
            lod_base_distance: 64.0,
            working_near: 0.1,
            working_far: 8192.0,
            player_half_extent: 4.0,
            max_aggregate_levels: 3,
        }
    }
}

/// Durable store parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,
    /// In-memory page cache budget in bytes
    pub cache_capacity_bytes: u64,
    /// Interval between background flushes (bounds buffered writes)
    pub flush_every_ms: u64,
    /// Membership filter size per stored key
    pub filter_bits_per_key: u32,
    /// Format used for new writes
    pub write_format: CompressionFormat,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("world.db"),
            cache_capacity_bytes: 64 * 1024 * 1024,
            flush_every_ms: 500,
            filter_bits_per_key: 10,
            write_format: CompressionFormat::Lz4,
        }
    }
}

/// Store client parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientStoreConfig {
    pub transport: ClientConfig,
    /// Completed responses kept before the least recently used is evicted
    pub completed_cache_capacity: usize,
}

impl Default for ClientStoreConfig {
    fn default() -> Self {
        Self {
            transport: ClientConfig::default(),
            completed_cache_capacity: 4096,
        }
    }
}

/// All streaming settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub selection: SelectionConfig,
    pub store: StoreConfig,
    pub client: ClientStoreConfig,
    pub server: ServerConfig,
}

impl StreamingConfig {
    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
