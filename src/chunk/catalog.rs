//! Collision sizes per part type

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;
use crate::math::Aabb;
use super::instance::PlacedInstance;

/// Maps part type ids to collision half-extents. Unknown types collide as a
/// unit cube.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartCatalog {
    half_extents: HashMap<u32, [f32; 3]>,
}

impl PartCatalog {
    const FALLBACK_HALF_EXTENT: Vec3 = Vec3::splat(0.5);

    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a part type with its full size
    pub fn with_part(mut self, part_type: u32, size: Vec3) -> Self {
        self.insert(part_type, size);
        self
    }

    /// Register (or replace) a part type with its full size
    pub fn insert(&mut self, part_type: u32, size: Vec3) {
        self.half_extents.insert(part_type, (size * 0.5).to_array());
    }

    /// Unrotated half-extents of a part type
    pub fn half_extent(&self, part_type: u32) -> Vec3 {
        self.half_extents
            .get(&part_type)
            .map(|h| Vec3::from_array(*h))
            .unwrap_or(Self::FALLBACK_HALF_EXTENT)
    }

    /// Axis-aligned box around the instance's rotated collision box, in the
    /// instance's own (chunk-local) frame
    pub fn collision_box(&self, instance: &PlacedInstance) -> Aabb {
        Aabb::from_oriented(
            instance.position(),
            self.half_extent(instance.part_type),
            instance.rotation(),
        )
    }
}
