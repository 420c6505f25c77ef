//! Bounding sphere

use crate::core::types::Vec3;
use super::aabb::Aabb;

/// Sphere used for proximity queries
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Check if the sphere touches or overlaps the box
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        aabb.distance_to_point(self.center) <= self.radius
    }

    /// Same sphere moved by `offset`
    pub fn translated(&self, offset: Vec3) -> Sphere {
        Sphere::new(self.center + offset, self.radius)
    }
}
