//! Grid traversal algorithm by Amanatides and Woo

use glam::IVec3;

use crate::core::types::Vec3;

/// Visits every unit cell a ray passes through, in order
pub struct GridRayTraversal {
    // Cell the ray is currently in
    cell: IVec3,
    // -1, 0 or +1 per axis
    step: IVec3,
    // Ray parameter needed to cross one cell along each axis
    t_delta: Vec3,
    // Ray parameter at which each axis next crosses a cell boundary
    t_max: Vec3,
    // Ray parameter at which the ray entered the current cell
    t_entry: f32,
}

impl GridRayTraversal {
    /// Start at `origin` and walk along `direction`
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        let cell = origin.floor().as_ivec3();
        let mut step = IVec3::ZERO;
        let mut t_delta = Vec3::splat(f32::INFINITY);
        let mut t_max = Vec3::splat(f32::INFINITY);

        for axis in 0..3 {
            let d = direction[axis];
            if d > 0.0 {
                step[axis] = 1;
                t_delta[axis] = 1.0 / d;
                t_max[axis] = ((cell[axis] + 1) as f32 - origin[axis]) / d;
            } else if d < 0.0 {
                step[axis] = -1;
                t_delta[axis] = -1.0 / d;
                t_max[axis] = (cell[axis] as f32 - origin[axis]) / d;
            }
        }

        Self {
            cell,
            step,
            t_delta,
            t_max,
            t_entry: 0.0,
        }
    }

    /// Move to the next closest cell along the ray
    pub fn step(&mut self) {
        let axis = if self.t_max.x < self.t_max.y {
            if self.t_max.x < self.t_max.z { 0 } else { 2 }
        } else if self.t_max.y < self.t_max.z {
            1
        } else {
            2
        };

        self.t_entry = self.t_max[axis];
        self.cell[axis] += self.step[axis];
        self.t_max[axis] += self.t_delta[axis];
    }

    /// Current cell. Changes on every call of `step`.
    pub fn current_cell(&self) -> IVec3 {
        self.cell
    }

    /// Ray parameter at which the current cell was entered
    pub fn t_entry(&self) -> f32 {
        self.t_entry
    }

    /// Ray parameter at which the current cell is left
    pub fn t_exit(&self) -> f32 {
        self.t_max.min_element()
    }
}
