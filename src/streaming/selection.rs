//! Per-frame chunk selection and world-space gameplay queries
//!
//! [`Selection`] owns the resident chunk set. Each [`Selection::update`]
//! runs the LOD pass, retires chunks that fell out of the wanted set,
//! creates the new ones, hands unfinished chunks to the background loader
//! and rebuilds the render set. Topology (which chunks exist) only changes
//! on the thread calling `update`; the loader thread only advances the
//! load state of chunks it was given.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use glam::IVec3;

use crate::chunk::{Chunk, PartCatalog, PlacedInstance, ReadyState, RenderArena, RenderHandle, ChunkDistances, COLLISION_EPSILON};
use crate::core::camera::Camera;
use crate::core::config::SelectionConfig;
use crate::core::error::Error;
use crate::core::types::{Quat, Result, Vec3};
use crate::math::{Aabb, Ray, Sphere};
use crate::octree::{MAX_LEVEL, OctreeAddress};
use crate::store::ChunkStore;
use super::loader::{ChunkLoader, SharedChunk, lock_chunk};
use super::lod::{LodStats, LodView, select_nodes};

/// A ready, non-empty chunk to draw this frame
#[derive(Clone, Debug)]
pub struct RenderChunk {
    pub address: OctreeAddress,
    pub distances: ChunkDistances,
    pub items: Vec<RenderHandle>,
}

/// Chunks to draw, farthest first, with the depth range they span
#[derive(Clone, Debug, Default)]
pub struct RenderSet {
    pub chunks: Vec<RenderChunk>,
    /// Smallest near distance over the set (clamped to the working near plane)
    pub near: f32,
    /// Largest far distance over the set
    pub far: f32,
    /// Geometric mean of `near` and `far`, where a renderer splits its depth range
    pub split_distance: f32,
}

/// What one update did
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionStats {
    pub lod: LodStats,
    /// Nodes chosen by the LOD pass
    pub wanted: usize,
    pub added: usize,
    pub removed: usize,
    /// Chunks handed to the loader (not ready yet)
    pub queued: usize,
    pub ready: usize,
    /// Chunks whose render items were rebuilt
    pub rebuilt: usize,
    pub render_chunks: usize,
    /// Resident chunks after the update
    pub resident: usize,
}

/// Nearest instance under a world-space ray
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    /// Chunk holding the instance
    pub address: OctreeAddress,
    /// Index into that chunk's instance list
    pub instance_index: usize,
    /// The instance, positioned in world space
    pub instance: PlacedInstance,
    /// World-space hit point
    pub point: Vec3,
    /// Unit cell containing the hit point
    pub voxel: IVec3,
    /// Distance along the ray
    pub distance: f32,
}

pub struct Selection {
    config: SelectionConfig,
    store: Arc<dyn ChunkStore>,
    catalog: PartCatalog,
    resident: BTreeMap<OctreeAddress, SharedChunk>,
    loader: ChunkLoader,
    arena: RenderArena,
    render_set: RenderSet,
}

impl Selection {
    /// Create an empty selection and start its loader thread
    pub fn new(mut config: SelectionConfig, store: Arc<dyn ChunkStore>, catalog: PartCatalog) -> Result<Self> {
        if config.leaf_level > MAX_LEVEL {
            log::warn!("Leaf level {} is deeper than the octree, using {}", config.leaf_level, MAX_LEVEL);
            config.leaf_level = MAX_LEVEL;
        }
        let loader = ChunkLoader::spawn(store.clone(), config.leaf_level, config.max_aggregate_levels)?;
        log::info!(
            "Selection started (leaf level {}, base distance {})",
            config.leaf_level,
            config.lod_base_distance
        );

        Ok(Self {
            config,
            store,
            catalog,
            resident: BTreeMap::new(),
            loader,
            arena: RenderArena::new(),
            render_set: RenderSet::default(),
        })
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn catalog(&self) -> &PartCatalog {
        &self.catalog
    }

    pub fn arena(&self) -> &RenderArena {
        &self.arena
    }

    /// Render set built by the last update
    pub fn render_set(&self) -> &RenderSet {
        &self.render_set
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Resident addresses in address order
    pub fn resident_addresses(&self) -> impl Iterator<Item = OctreeAddress> + '_ {
        self.resident.keys().copied()
    }

    /// Load state of a resident chunk
    pub fn chunk_state(&self, address: OctreeAddress) -> Option<ReadyState> {
        self.resident.get(&address).map(|chunk| lock_chunk(chunk).state())
    }

    /// Run one frame of selection for the given camera
    pub fn update(&mut self, camera: &Camera) -> SelectionStats {
        let leaf_level = self.config.leaf_level;
        let view = LodView::new(camera, &self.config);
        let (wanted, lod) = select_nodes(&view, &self.config);
        let mut stats = SelectionStats {
            lod,
            wanted: wanted.len(),
            ..Default::default()
        };

        let leaving: Vec<OctreeAddress> = self
            .resident
            .keys()
            .filter(|address| wanted.binary_search(address).is_err())
            .copied()
            .collect();
        for address in leaving {
            if let Some(chunk) = self.resident.remove(&address) {
                lock_chunk(&chunk).decommission(&mut self.arena, self.store.as_ref(), leaf_level);
                stats.removed += 1;
            }
        }

        for address in wanted {
            self.resident.entry(address).or_insert_with(|| {
                stats.added += 1;
                Arc::new(Mutex::new(Chunk::new(address)))
            });
        }

        let mut work: Vec<(f32, SharedChunk)> = Vec::new();
        let mut drawable = Vec::new();
        for (address, shared) in &self.resident {
            let mut chunk = lock_chunk(shared);
            chunk.update_distances(camera.position);
            if chunk.flush_render(&mut self.arena) {
                stats.rebuilt += 1;
            }
            chunk.flush_persist(self.store.as_ref(), leaf_level);

            if !chunk.is_ready() {
                work.push((chunk.distances.near, shared.clone()));
                continue;
            }
            stats.ready += 1;
            if !chunk.is_empty() {
                drawable.push(RenderChunk {
                    address: *address,
                    distances: chunk.distances,
                    items: chunk.render_items().to_vec(),
                });
            }
        }

        // The loader pops from the back: nearest last
        work.sort_by(|a, b| b.0.total_cmp(&a.0));
        stats.queued = work.len();
        self.loader.submit(work.into_iter().map(|(_, chunk)| chunk).collect());

        self.render_set = self.build_render_set(drawable);
        stats.render_chunks = self.render_set.chunks.len();
        stats.resident = self.resident.len();

        if stats.added > 0 || stats.removed > 0 {
            log::debug!(
                "Selection: {} wanted, +{} -{}, {} queued, {} ready",
                stats.wanted,
                stats.added,
                stats.removed,
                stats.queued,
                stats.ready
            );
        }
        stats
    }

    fn build_render_set(&self, mut chunks: Vec<RenderChunk>) -> RenderSet {
        if chunks.is_empty() {
            return RenderSet::default();
        }

        chunks.sort_by(|a, b| b.distances.mid.total_cmp(&a.distances.mid));
        let near = chunks
            .iter()
            .map(|c| c.distances.near)
            .fold(f32::INFINITY, f32::min)
            .max(self.config.working_near);
        let far = chunks
            .iter()
            .map(|c| c.distances.far)
            .fold(0.0, f32::max)
            .max(near);

        RenderSet {
            chunks,
            near,
            far,
            split_distance: (near * far).sqrt(),
        }
    }

    /// The resident leaf chunk containing a world point
    fn leaf_chunk(&self, point: Vec3) -> Result<&SharedChunk> {
        let address = OctreeAddress::from_point(point, self.config.leaf_level).ok_or(Error::OutOfWorld(point))?;
        self.resident.get(&address).ok_or(Error::ChunkNotResident(address))
    }

    /// Place a part at a world position. Its leaf chunk must be resident and
    /// ready; collision is not checked (see [`Self::can_add_part`]).
    pub fn add_part_inst(
        &mut self,
        part_type: u32,
        palette: u32,
        position: Vec3,
        rotation: Quat,
        connected: bool,
    ) -> Result<()> {
        let shared = self.leaf_chunk(position)?;
        let mut chunk = lock_chunk(shared);
        if !chunk.is_ready() {
            return Err(Error::ChunkNotReady(chunk.address()));
        }

        let local = position - chunk.center();
        chunk.add_part_inst(PlacedInstance::new(part_type, palette, local, rotation, connected));
        log::debug!("Added part {} to {}", part_type, chunk.address());
        Ok(())
    }

    /// Remove the part under a world point, returning it in world space
    pub fn remove_part(&mut self, point: Vec3) -> Result<Option<PlacedInstance>> {
        let shared = self.leaf_chunk(point)?;
        let mut chunk = lock_chunk(shared);
        if !chunk.is_ready() {
            return Err(Error::ChunkNotReady(chunk.address()));
        }

        let center = chunk.center();
        let removed = chunk.remove_part(point - center, &self.catalog);
        Ok(removed.map(|inst| inst.translated(center)))
    }

    /// World-space collision box a part would occupy
    pub fn part_box(&self, part_type: u32, position: Vec3, rotation: Quat) -> Aabb {
        self.catalog
            .collision_box(&PlacedInstance::new(part_type, 0, position, rotation, false))
    }

    /// Whether a world-space box can be occupied. Every leaf chunk the box
    /// overlaps must be resident and ready, and no part in any ready chunk
    /// may collide with it.
    pub fn can_add_part(&self, candidate: &Aabb) -> bool {
        let leaf_level = self.config.leaf_level;
        // A box ending exactly on a chunk face does not reach the next chunk
        let upper = (candidate.max - Vec3::splat(COLLISION_EPSILON)).max(candidate.min);
        let (Some(low), Some(high)) = (
            OctreeAddress::from_point(candidate.min, leaf_level),
            OctreeAddress::from_point(upper, leaf_level),
        ) else {
            return false;
        };

        for x in low.x..=high.x {
            for y in low.y..=high.y {
                for z in low.z..=high.z {
                    let Some(shared) = OctreeAddress::new(x, y, z, leaf_level).and_then(|a| self.resident.get(&a)) else {
                        return false;
                    };
                    if !lock_chunk(shared).is_ready() {
                        return false;
                    }
                }
            }
        }

        // Parts stored in a neighbouring chunk can reach across the shared face
        self.resident.values().all(|shared| {
            let chunk = lock_chunk(shared);
            if !chunk.is_ready() {
                return true;
            }
            let center = chunk.center();
            let reaches = chunk
                .content_bounds(&self.catalog)
                .is_some_and(|bounds| bounds.translated(center).overlaps(candidate, COLLISION_EPSILON));
            !reaches || chunk.can_add_part(&candidate.translated(-center), &self.catalog)
        })
    }

    /// Parts touching a world-space sphere, positioned in world space
    pub fn get_intersecting_parts(&self, sphere: &Sphere) -> Vec<PlacedInstance> {
        let mut found = Vec::new();
        for shared in self.resident.values() {
            let chunk = lock_chunk(shared);
            if !chunk.is_ready() {
                continue;
            }
            let center = chunk.center();
            let overlaps = chunk
                .content_bounds(&self.catalog)
                .is_some_and(|bounds| sphere.intersects_aabb(&bounds.translated(center)));
            if !overlaps {
                continue;
            }

            let local = sphere.translated(-center);
            found.extend(
                chunk
                    .intersecting_parts(&local, &self.catalog)
                    .into_iter()
                    .map(|(_, inst)| inst.translated(center)),
            );
        }
        found
    }

    /// Nearest part hit by a world-space ray. Chunks are tried in order of
    /// entry distance; the search stops once the next chunk starts beyond
    /// the best hit.
    pub fn intersects(&self, origin: Vec3, direction: Vec3) -> Option<RayHit> {
        let ray = Ray::new(origin, direction);

        let mut candidates: Vec<(f32, &SharedChunk)> = Vec::new();
        for shared in self.resident.values() {
            let chunk = lock_chunk(shared);
            if !chunk.is_ready() {
                continue;
            }
            let Some(bounds) = chunk.content_bounds(&self.catalog) else {
                continue;
            };
            if let Some((t_near, _)) = ray.intersects_aabb(&bounds.translated(chunk.center())) {
                candidates.push((t_near, shared));
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut best: Option<RayHit> = None;
        for (t_near, shared) in candidates {
            if best.is_some_and(|hit| t_near > hit.distance) {
                break;
            }

            let chunk = lock_chunk(shared);
            let center = chunk.center();
            let local = Ray::new(origin - center, ray.direction);
            let Some(hit) = chunk.pick(&local, &self.catalog) else {
                continue;
            };
            if best.is_none_or(|b| hit.t < b.distance) {
                let point = ray.at(hit.t);
                best = Some(RayHit {
                    address: chunk.address(),
                    instance_index: hit.instance,
                    instance: chunk.instances()[hit.instance].translated(center),
                    point,
                    voxel: point.floor().as_ivec3(),
                    distance: hit.t,
                });
            }
        }
        best
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.loader.shutdown();

        let leaf_level = self.config.leaf_level;
        for (_, chunk) in std::mem::take(&mut self.resident) {
            lock_chunk(&chunk).decommission(&mut self.arena, self.store.as_ref(), leaf_level);
        }
        log::debug!("Selection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{decode_payload, encode_payload};
    use crate::store::testing::MemoryStore;
    use std::time::Duration;

    fn brick_at_center() -> Vec<u8> {
        encode_payload(&[PlacedInstance::new(0, 2, Vec3::ZERO, Quat::IDENTITY, false)])
    }

    /// Leaf spanning [0, 16) on every axis
    fn near_leaf() -> OctreeAddress {
        OctreeAddress::from_point(Vec3::splat(8.0), 8).unwrap()
    }

    /// Leaf spanning [0, 16) x [0, 16) x [-32, -16), further along the view
    fn far_leaf() -> OctreeAddress {
        OctreeAddress::from_point(Vec3::new(8.0, 8.0, -24.0), 8).unwrap()
    }

    fn config() -> SelectionConfig {
        SelectionConfig {
            max_aggregate_levels: 1,
            ..Default::default()
        }
    }

    fn camera() -> Camera {
        Camera::look_at(Vec3::new(8.0, 8.0, 40.0), Vec3::new(8.0, 8.0, -100.0), Vec3::Y)
    }

    fn world() -> (Arc<MemoryStore>, Selection) {
        let store = Arc::new(
            MemoryStore::default()
                .with_chunk(near_leaf(), brick_at_center())
                .with_chunk(far_leaf(), brick_at_center()),
        );
        let selection = Selection::new(config(), store.clone(), PartCatalog::new()).unwrap();
        (store, selection)
    }

    /// Update until every resident chunk is ready
    fn settle(selection: &mut Selection, camera: &Camera) -> SelectionStats {
        for _ in 0..5000 {
            let stats = selection.update(camera);
            if stats.queued == 0 {
                return stats;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("selection never settled");
    }

    fn stored(store: &MemoryStore, address: OctreeAddress) -> Vec<PlacedInstance> {
        decode_payload(&store.chunks.lock().unwrap()[&address]).unwrap()
    }

    #[test]
    fn test_settled_selection_renders_stored_chunks() {
        let (_store, mut selection) = world();
        let stats = settle(&mut selection, &camera());

        assert!(stats.wanted > 0);
        assert_eq!(stats.ready, selection.resident_count());
        assert_eq!(stats.resident, selection.resident_count());
        assert_eq!(selection.chunk_state(near_leaf()), Some(ReadyState::Ready));
        assert_eq!(selection.chunk_state(near_leaf().parent().unwrap()), None);

        let set = selection.render_set();
        let order: Vec<OctreeAddress> = set.chunks.iter().map(|c| c.address).collect();
        assert_eq!(order, vec![far_leaf(), near_leaf()]);
        assert!(set.near <= set.split_distance && set.split_distance <= set.far);
        assert!((set.split_distance - (set.near * set.far).sqrt()).abs() < 1e-3);

        let near = &set.chunks[1];
        assert_eq!(near.items.len(), 1);
        let item = selection.arena().get(near.items[0]).unwrap();
        assert_eq!(item.palette, 2);
        assert_eq!(item.transform.w_axis.truncate(), Vec3::splat(8.0));
    }

    #[test]
    fn test_edits_need_resident_ready_chunk() {
        let (_store, mut selection) = world();
        selection.update(&camera());

        // One loader pass cannot take a chunk all the way to ready
        assert!(matches!(
            selection.add_part_inst(1, 0, Vec3::splat(8.0), Quat::IDENTITY, false),
            Err(Error::ChunkNotReady(a)) if a == near_leaf()
        ));
        assert!(matches!(
            selection.add_part_inst(1, 0, Vec3::splat(5000.0), Quat::IDENTITY, false),
            Err(Error::OutOfWorld(_))
        ));
        assert!(matches!(
            selection.add_part_inst(1, 0, Vec3::new(8.0, 8.0, 1000.0), Quat::IDENTITY, false),
            Err(Error::ChunkNotResident(_))
        ));
    }

    #[test]
    fn test_added_part_rendered_and_persisted() {
        let (store, mut selection) = world();
        let camera = camera();
        settle(&mut selection, &camera);

        selection
            .add_part_inst(5, 1, Vec3::new(9.5, 8.0, 8.0), Quat::IDENTITY, true)
            .unwrap();
        let stats = selection.update(&camera);
        assert_eq!(stats.rebuilt, 1);

        let instances = stored(&store, near_leaf());
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].position(), Vec3::new(1.5, 0.0, 0.0));
        assert!(instances[1].is_connected());

        let near = selection
            .render_set()
            .chunks
            .iter()
            .find(|c| c.address == near_leaf())
            .unwrap();
        assert_eq!(near.items.len(), 2);
    }

    #[test]
    fn test_remove_part_in_world_space() {
        let (store, mut selection) = world();
        let camera = camera();
        settle(&mut selection, &camera);

        assert_eq!(selection.remove_part(Vec3::new(3.0, 3.0, 3.0)).unwrap(), None);
        let removed = selection.remove_part(Vec3::new(8.2, 8.1, 8.0)).unwrap().unwrap();
        assert_eq!(removed.position(), Vec3::splat(8.0));

        selection.update(&camera);
        assert!(stored(&store, near_leaf()).is_empty());
        assert_eq!(selection.render_set().chunks.len(), 1);
    }

    #[test]
    fn test_can_add_part() {
        let (_store, mut selection) = world();
        settle(&mut selection, &camera());

        let overlapping = selection.part_box(0, Vec3::new(8.3, 8.0, 8.0), Quat::IDENTITY);
        assert!(!selection.can_add_part(&overlapping));

        let touching = selection.part_box(0, Vec3::new(9.0, 8.0, 8.0), Quat::IDENTITY);
        assert!(selection.can_add_part(&touching));

        // Straddles the face between two resident leaves
        let straddling = selection.part_box(0, Vec3::new(16.0, 8.0, 8.0), Quat::IDENTITY);
        assert!(selection.can_add_part(&straddling));

        let unloaded = selection.part_box(0, Vec3::new(8.0, 8.0, 1000.0), Quat::IDENTITY);
        assert!(!selection.can_add_part(&unloaded));

        let outside = selection.part_box(0, Vec3::splat(5000.0), Quat::IDENTITY);
        assert!(!selection.can_add_part(&outside));
    }

    #[test]
    fn test_can_add_part_sees_parts_reaching_across_chunk_face() {
        let (_store, mut selection) = world();
        settle(&mut selection, &camera());

        // Stored in the near leaf, reaching 0.4 into its neighbour
        selection
            .add_part_inst(0, 0, Vec3::new(15.9, 8.0, 8.0), Quat::IDENTITY, false)
            .unwrap();

        let across = selection.part_box(0, Vec3::new(16.6, 8.0, 8.0), Quat::IDENTITY);
        assert!(!selection.can_add_part(&across));

        let clear = selection.part_box(0, Vec3::new(16.95, 8.0, 8.0), Quat::IDENTITY);
        assert!(selection.can_add_part(&clear));
    }

    #[test]
    fn test_leaf_level_clamped_to_deepest_level() {
        let store = Arc::new(MemoryStore::default());
        let config = SelectionConfig {
            leaf_level: MAX_LEVEL + 4,
            ..config()
        };
        let selection = Selection::new(config, store, PartCatalog::new()).unwrap();
        assert_eq!(selection.config().leaf_level, MAX_LEVEL);
    }

    #[test]
    fn test_intersecting_parts_in_world_space() {
        let (_store, mut selection) = world();
        settle(&mut selection, &camera());

        let found = selection.get_intersecting_parts(&Sphere::new(Vec3::new(8.0, 8.0, 8.9), 0.5));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position(), Vec3::splat(8.0));

        assert!(selection.get_intersecting_parts(&Sphere::new(Vec3::splat(3.0), 1.0)).is_empty());
    }

    #[test]
    fn test_ray_hits_nearest_part() {
        let (_store, mut selection) = world();
        let camera = camera();
        settle(&mut selection, &camera);

        let hit = selection.intersects(camera.position, -Vec3::Z).unwrap();
        assert_eq!(hit.address, near_leaf());
        assert_eq!(hit.instance_index, 0);
        assert_eq!(hit.instance.position(), Vec3::splat(8.0));
        assert!((hit.distance - 31.5).abs() < 1e-3);
        assert_eq!(hit.voxel, IVec3::splat(8));

        assert!(selection.intersects(camera.position, Vec3::Z).is_none());
    }

    #[test]
    fn test_moving_away_decommissions_and_flushes() {
        let (store, mut selection) = world();
        settle(&mut selection, &camera());
        selection
            .add_part_inst(5, 1, Vec3::new(9.5, 8.0, 8.0), Quat::IDENTITY, false)
            .unwrap();

        let away = Camera::look_at(Vec3::new(1500.0, 8.0, 1500.0), Vec3::new(2000.0, 8.0, 1500.0), Vec3::Y);
        let stats = selection.update(&away);

        assert!(stats.removed > 0);
        assert_eq!(selection.chunk_state(near_leaf()), None);
        assert_eq!(stored(&store, near_leaf()).len(), 2);
    }

    #[test]
    fn test_drop_flushes_edits() {
        let (store, mut selection) = world();
        settle(&mut selection, &camera());
        selection
            .add_part_inst(5, 1, Vec3::new(8.0, 9.5, 8.0), Quat::IDENTITY, false)
            .unwrap();

        drop(selection);
        assert_eq!(stored(&store, near_leaf()).len(), 2);
    }
}
