//! Octree node addressing

use std::fmt;

use crate::core::types::{UVec3, Vec3};
use crate::math::Aabb;

/// Bits per axis of the deepest addressable level
pub const ADDRESS_BITS: u8 = 12;

/// Deepest addressable level
pub const MAX_LEVEL: u8 = ADDRESS_BITS;

/// World-space edge length of the level 0 node
pub const WORLD_SIZE: f32 = (1u32 << ADDRESS_BITS) as f32;

/// World-space position of the level 0 node's minimum corner.
/// Puts the world center at the origin.
pub const WORLD_ORIGIN: Vec3 = Vec3::splat(-WORLD_SIZE * 0.5);

/// One cube of the world octree.
///
/// Level 0 is the whole world; each level halves the edge length.
/// Coordinates satisfy `0 <= x, y, z < 2^level`.
///
/// Ordering compares `level`, then `x`, `y`, `z` (field declaration order),
/// so all nodes of one level are contiguous.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OctreeAddress {
    pub level: u8,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl OctreeAddress {
    /// The level 0 node
    pub const ROOT: Self = Self { level: 0, x: 0, y: 0, z: 0 };

    /// Build an address, or `None` if the level is too deep or a coordinate
    /// is out of range for it
    pub fn new(x: u32, y: u32, z: u32, level: u8) -> Option<Self> {
        if level > MAX_LEVEL {
            return None;
        }
        let span = 1u32 << level;
        (x < span && y < span && z < span).then_some(Self { level, x, y, z })
    }

    /// Coordinates as a vector
    pub fn coords(&self) -> UVec3 {
        UVec3::new(self.x, self.y, self.z)
    }

    /// World-space edge length of a node at `level`
    pub fn extent_at(level: u8) -> f32 {
        (1u32 << (ADDRESS_BITS - level.min(MAX_LEVEL))) as f32
    }

    /// World-space edge length of this node
    pub fn extent(&self) -> f32 {
        Self::extent_at(self.level)
    }

    /// World-space box covered by this node
    pub fn bounding_box(&self) -> Aabb {
        let extent = self.extent();
        let min = WORLD_ORIGIN + self.coords().as_vec3() * extent;
        Aabb::new(min, min + Vec3::splat(extent))
    }

    /// World-space center of this node
    pub fn center(&self) -> Vec3 {
        let extent = self.extent();
        WORLD_ORIGIN + (self.coords().as_vec3() + Vec3::splat(0.5)) * extent
    }

    /// Enclosing node one level up (`None` for the root)
    pub fn parent(&self) -> Option<Self> {
        (self.level > 0).then(|| Self {
            level: self.level - 1,
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
        })
    }

    /// Enclosing node at a shallower (or equal) level
    pub fn parent_at_level(&self, level: u8) -> Option<Self> {
        if level > self.level {
            return None;
        }
        let shift = self.level - level;
        Some(Self {
            level,
            x: self.x >> shift,
            y: self.y >> shift,
            z: self.z >> shift,
        })
    }

    /// The 8 children, indexed by octant (bit 0 = x, bit 1 = y, bit 2 = z).
    /// Empty at the deepest level.
    pub fn children(&self) -> Vec<Self> {
        if self.level >= MAX_LEVEL {
            return Vec::new();
        }
        (0..8u32)
            .map(|octant| Self {
                level: self.level + 1,
                x: (self.x << 1) | (octant & 1),
                y: (self.y << 1) | ((octant >> 1) & 1),
                z: (self.z << 1) | ((octant >> 2) & 1),
            })
            .collect()
    }

    /// Number of descendants at `level` (1 for its own level, 0 for
    /// shallower or out-of-range levels). Saturates where `usize` cannot hold it.
    pub fn descendant_count(&self, level: u8) -> usize {
        if level < self.level || level > MAX_LEVEL {
            return 0;
        }
        let shift = 3 * u32::from(level - self.level);
        1usize.checked_shl(shift).unwrap_or(usize::MAX)
    }

    /// Every descendant at `level`, in address order. Returns just this node
    /// when `level` equals its own level and nothing for shallower levels.
    pub fn children_at_level(&self, level: u8) -> Vec<Self> {
        if level < self.level || level > MAX_LEVEL {
            return Vec::new();
        }
        let shift = level - self.level;
        let span = 1u32 << shift;
        let base = UVec3::new(self.x << shift, self.y << shift, self.z << shift);

        let mut out = Vec::with_capacity(self.descendant_count(level));
        for x in 0..span {
            for y in 0..span {
                for z in 0..span {
                    out.push(Self {
                        level,
                        x: base.x + x,
                        y: base.y + y,
                        z: base.z + z,
                    });
                }
            }
        }
        out
    }

    /// The unique node at `level` containing a world-space point.
    /// Points on a shared face belong to the node on the positive side.
    pub fn from_point(point: Vec3, level: u8) -> Option<Self> {
        if level > MAX_LEVEL || !point.is_finite() {
            return None;
        }
        let cell = ((point - WORLD_ORIGIN) / Self::extent_at(level)).floor();
        let span = (1u32 << level) as f32;
        if cell.cmplt(Vec3::ZERO).any() || cell.cmpge(Vec3::splat(span)).any() {
            return None;
        }
        let cell = cell.as_uvec3();
        Some(Self {
            level,
            x: cell.x,
            y: cell.y,
            z: cell.z,
        })
    }

    /// Whether `other` is this node or one of its descendants
    pub fn contains(&self, other: &Self) -> bool {
        other.parent_at_level(self.level).as_ref() == Some(self)
    }
}

impl fmt::Display for OctreeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}({}, {}, {})", self.level, self.x, self.y, self.z)
    }
}
