//! Resident chunk: instance list, load state machine and dirty flags

use std::collections::HashMap;

use glam::IVec3;

use crate::core::types::{Mat4, Result, Vec3};
use crate::math::{Aabb, GridRayTraversal, Ray, Sphere};
use crate::octree::OctreeAddress;
use crate::store::{ChunkFetch, ChunkStore};
use super::catalog::PartCatalog;
use super::instance::{PlacedInstance, decode_payload, encode_payload};
use super::render::{RenderArena, RenderHandle, RenderItem};

/// Boxes must overlap deeper than this to collide
pub const COLLISION_EPSILON: f32 = 1e-4;

/// Load progress. Each [`Chunk::background_load`] call advances at most one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    Unrequested = 0,
    Requested = 1,
    Resolved = 2,
    Ready = 3,
}

/// What a load step needs from its surroundings
#[derive(Clone, Copy)]
pub struct LoadContext<'a> {
    pub store: &'a dyn ChunkStore,
    /// Level whose chunks are persisted
    pub leaf_level: u8,
    /// Coarse chunks further above the leaf level than this load empty
    pub max_aggregate_levels: u8,
}

/// Camera-relative distances used for render ordering
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChunkDistances {
    /// To the closest point of the bounding box
    pub near: f32,
    /// To the center
    pub mid: f32,
    /// To the farthest corner
    pub far: f32,
}

/// Nearest ray hit inside one chunk, in chunk-local terms
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkHit {
    /// Index into the instance list
    pub instance: usize,
    /// Unit cell containing the hit point, relative to the chunk center
    pub cell: IVec3,
    /// Ray parameter of the hit
    pub t: f32,
}

struct Gathering {
    /// Leaves not answered yet
    unresolved: Vec<OctreeAddress>,
    /// Re-centred instances of the leaves answered so far
    instances: Vec<PlacedInstance>,
}

pub struct Chunk {
    address: OctreeAddress,
    state: ReadyState,
    instances: Vec<PlacedInstance>,
    /// Result of a load that finished during the request step
    staged: Option<Vec<PlacedInstance>>,
    /// Leaf reads of a coarse load, kept across visits
    gathering: Option<Gathering>,
    pub distances: ChunkDistances,
    needs_rebuild: bool,
    needs_persist: bool,
    render_items: Vec<RenderHandle>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("instances", &self.instances.len())
            .field("render_items", &self.render_items.len())
            .finish()
    }
}

impl Chunk {
    pub fn new(address: OctreeAddress) -> Self {
        Self {
            address,
            state: ReadyState::Unrequested,
            instances: Vec::new(),
            staged: None,
            gathering: None,
            distances: ChunkDistances::default(),
            needs_rebuild: false,
            needs_persist: false,
            render_items: Vec::new(),
        }
    }

    pub fn address(&self) -> OctreeAddress {
        self.address
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReadyState::Ready
    }

    pub fn instances(&self) -> &[PlacedInstance] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn needs_persist(&self) -> bool {
        self.needs_persist
    }

    pub fn render_items(&self) -> &[RenderHandle] {
        &self.render_items
    }

    pub fn center(&self) -> Vec3 {
        self.address.center()
    }

    pub fn bounding_box(&self) -> Aabb {
        self.address.bounding_box()
    }

    /// Advance the load state machine by at most one step.
    ///
    /// Store errors leave the state unchanged so the next visit retries.
    /// An absent payload resolves to an empty chunk; a malformed one is
    /// logged and also resolves empty.
    pub fn background_load(&mut self, ctx: &LoadContext<'_>) {
        match self.state {
            ReadyState::Unrequested => match self.fetch(ctx) {
                Ok(result) => {
                    self.staged = result;
                    self.state = ReadyState::Requested;
                }
                Err(e) => log::warn!("Load of {} failed, will retry: {}", self.address, e),
            },
            ReadyState::Requested => {
                let result = match self.staged.take() {
                    Some(instances) => Ok(Some(instances)),
                    None => self.fetch(ctx),
                };
                match result {
                    Ok(Some(instances)) => {
                        self.instances = instances;
                        self.state = ReadyState::Resolved;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Load of {} failed, will retry: {}", self.address, e),
                }
            }
            ReadyState::Resolved => {
                self.needs_rebuild = true;
                self.state = ReadyState::Ready;
                log::trace!("{} ready with {} instances", self.address, self.instances.len());
            }
            ReadyState::Ready => {}
        }
    }

    /// Try to obtain this chunk's content. `Ok(None)` while any read is
    /// still pending.
    fn fetch(&mut self, ctx: &LoadContext<'_>) -> Result<Option<Vec<PlacedInstance>>> {
        let address = self.address;
        if address.level >= ctx.leaf_level {
            return Ok(match ctx.store.get_chunk(address)? {
                ChunkFetch::Pending => None,
                ChunkFetch::Absent => Some(Vec::new()),
                ChunkFetch::Found(bytes) => Some(decode_or_empty(address, address, &bytes)),
            });
        }

        if ctx.leaf_level - address.level > ctx.max_aggregate_levels {
            return Ok(Some(Vec::new()));
        }

        let center = self.center();
        let gathering = self.gathering.get_or_insert_with(|| Gathering {
            unresolved: address.children_at_level(ctx.leaf_level),
            instances: Vec::new(),
        });

        // One call for every unresolved leaf, so they are all in flight together
        let results = ctx.store.get_chunks(&gathering.unresolved);
        let mut waiting = Vec::new();
        let mut first_error = None;
        for (leaf, result) in gathering.unresolved.iter().zip(results) {
            match result {
                Ok(ChunkFetch::Pending) => waiting.push(*leaf),
                Ok(ChunkFetch::Absent) => {}
                Ok(ChunkFetch::Found(bytes)) => {
                    let offset = leaf.center() - center;
                    gathering.instances.extend(
                        decode_or_empty(address, *leaf, &bytes)
                            .into_iter()
                            .map(|inst| inst.translated(offset)),
                    );
                }
                Err(e) => {
                    waiting.push(*leaf);
                    first_error.get_or_insert(e);
                }
            }
        }
        gathering.unresolved = waiting;

        if let Some(e) = first_error {
            return Err(e);
        }
        if !gathering.unresolved.is_empty() {
            return Ok(None);
        }
        Ok(self.gathering.take().map(|gathering| gathering.instances))
    }

    /// Append an instance (position relative to the chunk center)
    pub fn add_part_inst(&mut self, instance: PlacedInstance) {
        self.instances.push(instance);
        self.needs_rebuild = true;
        self.needs_persist = true;
    }

    /// Remove the instance whose collision box contains `local_point`,
    /// preferring the one whose center is nearest
    pub fn remove_part(&mut self, local_point: Vec3, catalog: &PartCatalog) -> Option<PlacedInstance> {
        let index = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| catalog.collision_box(inst).contains_point(local_point))
            .min_by(|(_, a), (_, b)| {
                let da = a.position().distance_squared(local_point);
                let db = b.position().distance_squared(local_point);
                da.total_cmp(&db)
            })
            .map(|(i, _)| i)?;

        let removed = self.instances.remove(index);
        self.needs_rebuild = true;
        self.needs_persist = true;
        Some(removed)
    }

    /// Whether a part with the given chunk-local collision box fits without
    /// overlapping any existing instance. Touching faces are allowed.
    pub fn can_add_part(&self, candidate: &Aabb, catalog: &PartCatalog) -> bool {
        !self
            .instances
            .iter()
            .any(|inst| catalog.collision_box(inst).overlaps(candidate, COLLISION_EPSILON))
    }

    /// Instances whose collision box touches a chunk-local sphere
    pub fn intersecting_parts(&self, sphere: &Sphere, catalog: &PartCatalog) -> Vec<(usize, PlacedInstance)> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| sphere.intersects_aabb(&catalog.collision_box(inst)))
            .map(|(i, inst)| (i, *inst))
            .collect()
    }

    /// Chunk-local box around every instance's collision box, or `None`
    /// when the chunk is empty. Instances may reach past the chunk bounds.
    pub fn content_bounds(&self, catalog: &PartCatalog) -> Option<Aabb> {
        self.instances
            .iter()
            .map(|inst| catalog.collision_box(inst))
            .reduce(|a, b| a.merged(&b))
    }

    /// Nearest instance hit by a chunk-local ray, walking unit cells from
    /// the near side so the search stops in the first cell that holds a hit
    pub fn pick(&self, ray: &Ray, catalog: &PartCatalog) -> Option<ChunkHit> {
        if self.instances.is_empty() {
            return None;
        }

        let boxes: Vec<Aabb> = self.instances.iter().map(|i| catalog.collision_box(i)).collect();
        let mut bounds = Aabb::from_center_half_extent(Vec3::ZERO, Vec3::splat(self.address.extent() * 0.5));
        let mut cells: HashMap<IVec3, Vec<usize>> = HashMap::new();
        for (index, aabb) in boxes.iter().enumerate() {
            bounds = bounds.merged(aabb);
            let min = aabb.min.floor().as_ivec3();
            let max = aabb.max.ceil().as_ivec3() - IVec3::ONE;
            for x in min.x..=max.x {
                for y in min.y..=max.y {
                    for z in min.z..=max.z {
                        cells.entry(IVec3::new(x, y, z)).or_default().push(index);
                    }
                }
            }
        }

        let (t_start, t_end) = ray.intersects_aabb(&bounds)?;
        let mut traversal = GridRayTraversal::new(ray.at(t_start), ray.direction);
        let size = bounds.size();
        let max_steps = (size.x + size.y + size.z).ceil() as usize + 3;

        let mut best: Option<(usize, f32)> = None;
        for _ in 0..max_steps {
            let cell_exit = t_start + traversal.t_exit();
            if let Some(indices) = cells.get(&traversal.current_cell()) {
                for &index in indices {
                    if let Some((t, _)) = ray.intersects_aabb(&boxes[index]) {
                        if best.is_none_or(|(_, best_t)| t < best_t) {
                            best = Some((index, t));
                        }
                    }
                }
            }
            // A hit no later than this cell's exit cannot be beaten by later cells
            if let Some((instance, t)) = best {
                if t <= cell_exit {
                    let cell = ray.at(t).floor().as_ivec3();
                    return Some(ChunkHit { instance, cell, t });
                }
            }
            if t_start + traversal.t_entry() > t_end {
                break;
            }
            traversal.step();
        }

        best.map(|(instance, t)| ChunkHit {
            instance,
            cell: ray.at(t).floor().as_ivec3(),
            t,
        })
    }

    /// Update camera-relative distances
    pub fn update_distances(&mut self, camera_position: Vec3) {
        let aabb = self.bounding_box();
        self.distances = ChunkDistances {
            near: aabb.distance_to_point(camera_position),
            mid: self.center().distance(camera_position),
            far: aabb.farthest_distance(camera_position),
        };
    }

    /// Rebuild render items if the content changed since the last build.
    /// Returns whether anything was rebuilt.
    pub fn flush_render(&mut self, arena: &mut RenderArena) -> bool {
        if !self.is_ready() || !self.needs_rebuild {
            return false;
        }
        self.teardown(arena);

        let center = self.center();
        for (index, inst) in self.instances.iter().enumerate() {
            let handle = arena.insert(RenderItem {
                chunk: self.address,
                instance: index,
                part_type: inst.part_type,
                palette: inst.palette,
                transform: Mat4::from_rotation_translation(inst.rotation(), center + inst.position()),
            });
            self.render_items.push(handle);
        }
        self.needs_rebuild = false;
        true
    }

    /// Write edits back to the store. Only leaf chunks are persisted; a
    /// failed write is logged and not retried.
    pub fn flush_persist(&mut self, store: &dyn ChunkStore, leaf_level: u8) {
        if !self.needs_persist {
            return;
        }
        self.needs_persist = false;

        if self.address.level != leaf_level {
            return;
        }
        let payload = encode_payload(&self.instances);
        match store.write_chunk(self.address, &payload) {
            Ok(()) => log::debug!("Persisted {} ({} instances)", self.address, self.instances.len()),
            Err(e) => log::warn!("Failed to persist {}: {}", self.address, e),
        }
    }

    /// Remove every render item this chunk owns
    pub fn teardown(&mut self, arena: &mut RenderArena) {
        for handle in self.render_items.drain(..) {
            arena.remove(handle);
        }
    }

    /// Leave the active set: drop render items and flush pending writes
    pub fn decommission(&mut self, arena: &mut RenderArena, store: &dyn ChunkStore, leaf_level: u8) {
        self.teardown(arena);
        self.flush_persist(store, leaf_level);
    }
}

fn decode_or_empty(loading: OctreeAddress, source: OctreeAddress, bytes: &[u8]) -> Vec<PlacedInstance> {
    decode_payload(bytes).unwrap_or_else(|e| {
        log::warn!("Discarding payload of {} (loading {}): {}", source, loading, e);
        Vec::new()
    })
}
