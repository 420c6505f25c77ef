//! Ray type and slab test

use crate::core::types::Vec3;
use super::aabb::Aabb;

/// A ray defined by origin and direction
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    /// Precomputed 1/direction for fast AABB intersection
    pub inv_direction: Vec3,
}

impl Ray {
    /// Create a new ray. The direction is normalized; a zero direction
    /// yields a ray that hits nothing.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        let direction = direction.normalize_or_zero();
        Self {
            origin,
            direction,
            inv_direction: direction.recip(),
        }
    }

    /// Get point along ray at parameter t
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Ray-AABB intersection using slab method
    /// Returns Some((t_near, t_far)) if intersection, None otherwise.
    /// `t_near` is clamped to 0 when the origin is inside the box.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        if self.direction == Vec3::ZERO {
            return None;
        }

        let mut t_near = f32::NEG_INFINITY;
        let mut t_far = f32::INFINITY;
        for axis in 0..3 {
            let origin = self.origin[axis];
            if self.direction[axis] == 0.0 {
                // Parallel to this slab pair: inside it for every t, or never
                if origin < aabb.min[axis] || origin > aabb.max[axis] {
                    return None;
                }
                continue;
            }

            let t1 = (aabb.min[axis] - origin) * self.inv_direction[axis];
            let t2 = (aabb.max[axis] - origin) * self.inv_direction[axis];
            t_near = t_near.max(t1.min(t2));
            t_far = t_far.min(t1.max(t2));
        }

        if t_near <= t_far && t_far >= 0.0 {
            Some((t_near.max(0.0), t_far))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at() {
        let ray = Ray::new(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(ray.at(5.0), Vec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_intersects_aabb_hit() {
        let ray = Ray::new(Vec3::new(-2.0, 0.5, 0.5), Vec3::X);
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let (t_near, t_far) = ray.intersects_aabb(&aabb).unwrap();
        assert!((t_near - 2.0).abs() < 0.001);
        assert!((t_far - 3.0).abs() < 0.001);
    }

    #[test]
    fn test_intersects_aabb_miss() {
        let ray = Ray::new(Vec3::new(-2.0, 5.0, 0.5), Vec3::X);
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(ray.intersects_aabb(&aabb).is_none());

        let behind = Ray::new(Vec3::new(2.0, 0.5, 0.5), Vec3::X);
        assert!(behind.intersects_aabb(&aabb).is_none());
    }

    #[test]
    fn test_intersects_aabb_inside() {
        let ray = Ray::new(Vec3::splat(0.5), Vec3::X);
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let (t_near, _) = ray.intersects_aabb(&aabb).unwrap();
        assert_eq!(t_near, 0.0);
    }

    #[test]
    fn test_origin_on_slab_plane() {
        // Parallel to the y slabs and exactly on one of them
        let ray = Ray::new(Vec3::new(-1.0, 0.0, 0.5), Vec3::X);
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(ray.intersects_aabb(&aabb).is_some());
    }

    #[test]
    fn test_zero_direction_never_hits() {
        let ray = Ray::new(Vec3::splat(0.5), Vec3::ZERO);
        assert!(ray.intersects_aabb(&Aabb::new(Vec3::ZERO, Vec3::ONE)).is_none());
    }
}
