//! Level of Detail (LOD) selection over the world octree
//!
//! Each frame the octree is walked from the root. A node whose level is
//! at least its distance-based target level is selected as-is; otherwise
//! its visible children are walked. The result covers every visible part of
//! the world exactly once, with detail falling off with distance:
//!
//! - distance < base: leaf level
//! - base..2*base: leaf - 1
//! - 2*base..4*base: leaf - 2
//! - and so on, down to level 0

use crate::core::camera::Camera;
use crate::core::config::SelectionConfig;
use crate::core::types::Vec3;
use crate::math::{Aabb, Containment, Frustum};
use crate::octree::OctreeAddress;

/// Distances below this are treated as this (camera inside a node)
pub const MIN_LOD_DISTANCE: f32 = 1e-3;

/// Calculate the octree level a node at `distance` should be drawn at
///
/// # Arguments
/// * `distance` - Distance from the camera to the node's bounding box
/// * `leaf_level` - Finest level
/// * `base_distance` - Distance at which detail first drops below the leaf level
///
/// # Examples
/// ```
/// use brickstream::streaming::lod::target_level;
///
/// assert_eq!(target_level(0.0, 8, 64.0), 8);
/// assert_eq!(target_level(100.0, 8, 64.0), 8);
/// assert_eq!(target_level(128.0, 8, 64.0), 7);
/// assert_eq!(target_level(1.0e9, 8, 64.0), 0);
/// ```
pub fn target_level(distance: f32, leaf_level: u8, base_distance: f32) -> u8 {
    let ratio = distance.max(MIN_LOD_DISTANCE) / base_distance.max(MIN_LOD_DISTANCE);
    let drop = ratio.log2().floor();
    if drop <= 0.0 {
        leaf_level
    } else {
        leaf_level.saturating_sub(drop.min(u8::MAX as f32) as u8)
    }
}

/// Camera-derived inputs of one LOD pass
#[derive(Clone, Copy, Debug)]
pub struct LodView {
    pub position: Vec3,
    pub forward: Vec3,
    /// Frustum over the wide working depth range
    pub frustum: Frustum,
    /// Always kept at full detail regardless of view direction
    pub player_box: Aabb,
}

impl LodView {
    pub fn new(camera: &Camera, config: &SelectionConfig) -> Self {
        Self {
            position: camera.position,
            forward: camera.forward(),
            frustum: camera.frustum_with_range(config.working_near, config.working_far),
            player_box: Aabb::from_center_half_extent(
                camera.position,
                Vec3::splat(config.player_half_extent),
            ),
        }
    }

    /// Whether the whole box lies behind the camera plane
    fn is_behind(&self, aabb: &Aabb) -> bool {
        let front = Vec3::select(self.forward.cmpge(Vec3::ZERO), aabb.max, aabb.min);
        (front - self.position).dot(self.forward) < 0.0
    }
}

/// Counters of one pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LodStats {
    pub visited: usize,
    /// Nodes selected because none of their children were
    pub fills: usize,
    /// Behind-camera leaves kept to complete a branch
    pub deferred: usize,
}

/// Run the LOD pass. The result is sorted in address order and no
/// selected node contains another.
pub fn select_nodes(view: &LodView, config: &SelectionConfig) -> (Vec<OctreeAddress>, LodStats) {
    let mut selected = Vec::new();
    let mut stats = LodStats::default();
    let leaf_level = config.leaf_level.min(crate::octree::MAX_LEVEL);

    visit(OctreeAddress::ROOT, false, view, config, leaf_level, &mut selected, &mut stats);

    selected.sort_unstable();
    (selected, stats)
}

fn visit(
    node: OctreeAddress,
    fully_inside: bool,
    view: &LodView,
    config: &SelectionConfig,
    leaf_level: u8,
    selected: &mut Vec<OctreeAddress>,
    stats: &mut LodStats,
) {
    stats.visited += 1;

    let aabb = node.bounding_box();
    let target = target_level(aabb.distance_to_point(view.position), leaf_level, config.lod_base_distance);
    if node.level >= target || node.level >= leaf_level {
        selected.push(node);
        return;
    }

    let mark = selected.len();
    let mut deferred = Vec::new();

    for child in node.children() {
        let child_box = child.bounding_box();

        if child_box.intersects(&view.player_box) {
            visit(child, fully_inside, view, config, leaf_level, selected, stats);
            continue;
        }

        if view.is_behind(&child_box) {
            if child.level >= leaf_level {
                deferred.push(child);
            }
            continue;
        }

        let child_inside = fully_inside
            || match view.frustum.classify_aabb(&child_box) {
                Containment::Outside => continue,
                Containment::Intersecting => false,
                Containment::Inside => true,
            };
        visit(child, child_inside, view, config, leaf_level, selected, stats);
    }

    if selected.len() == mark {
        // Nothing below survived: cover the branch with this node
        selected.push(node);
        stats.fills += 1;
    } else if !deferred.is_empty() {
        stats.deferred += deferred.len();
        selected.extend(deferred);
    }
}
