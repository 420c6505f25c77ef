//! Axis-aligned bounding box

use crate::core::types::{Quat, Vec3};

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create AABB from center and half-extents
    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    /// Box enclosing an oriented box with the given center, half-extents and rotation
    pub fn from_oriented(center: Vec3, half_extent: Vec3, rotation: Quat) -> Self {
        // Extent along each world axis is the sum of the rotated basis
        // vectors' absolute projections
        let x = (rotation * Vec3::new(half_extent.x, 0.0, 0.0)).abs();
        let y = (rotation * Vec3::new(0.0, half_extent.y, 0.0)).abs();
        let z = (rotation * Vec3::new(0.0, 0.0, half_extent.z)).abs();
        Self::from_center_half_extent(center, x + y + z)
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Get half-extents
    pub fn half_extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// Check if point is inside AABB (boundary inclusive)
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Check if two AABBs intersect (touching counts)
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Check if two AABBs share volume deeper than `epsilon` on every axis.
    /// Boxes that only touch, or overlap by less than `epsilon`, do not count.
    pub fn overlaps(&self, other: &Aabb, epsilon: f32) -> bool {
        self.min.x < other.max.x - epsilon && self.max.x > other.min.x + epsilon &&
        self.min.y < other.max.y - epsilon && self.max.y > other.min.y + epsilon &&
        self.min.z < other.max.z - epsilon && self.max.z > other.min.z + epsilon
    }

    /// Same box moved by `offset`
    pub fn translated(&self, offset: Vec3) -> Aabb {
        Aabb {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Closest point of the box to `p`
    pub fn closest_point(&self, p: Vec3) -> Vec3 {
        p.clamp(self.min, self.max)
    }

    /// Distance from `p` to the box (0 inside)
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        (self.closest_point(p) - p).length()
    }

    /// Distance from `p` to the farthest corner of the box
    pub fn farthest_distance(&self, p: Vec3) -> f32 {
        let far = Vec3::select(
            (p - self.min).cmpgt(self.max - p),
            self.min,
            self.max,
        );
        (far - p).length()
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}
