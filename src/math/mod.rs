//! Geometry primitives

pub mod aabb;
pub mod ray;
pub mod sphere;
pub mod frustum;
pub mod grid_ray;

pub use aabb::Aabb;
pub use ray::Ray;
pub use sphere::Sphere;
pub use frustum::{Containment, Frustum, Plane};
pub use grid_ray::GridRayTraversal;
