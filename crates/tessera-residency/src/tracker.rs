//! Tile Tracker
//!
//! Owns every tracked tile, the physical pool and the three work queues, and
//! turns each frame's feedback into coalesced mapping updates.
//!
//! ## Frame update
//! 1. Drain load completions delivered since the last frame
//! 2. Ingest samples, touching the sampled tile and every coarser mapped mip
//! 3. Sort the seen, loading and mapped queues in parallel
//! 4. Dispatch loads up to the concurrency limit
//! 5. Map loaded tiles in queue order, evicting or discarding as needed
//! 6. Flush mapping batches, tile uploads and changed residency shadows
//!
//! Loads run on a tokio runtime and report back over a channel; background
//! tasks never touch tracker state.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, Sender};
use slotmap::SlotMap;
use tessera_core::{CubeFace, FrameCounter, FrameNumber, ResidencyConfig};
use tokio::runtime::Handle;

use crate::decoder::DecodedSample;
use crate::device::{TileMappingBatch, TileMappingUpdate, TiledResourceDevice};
use crate::pool::PhysicalTilePool;
use crate::resource::{ManagedTiledResource, PackedState, ResourceId};
use crate::source::{TileFuture, TileSource};
use crate::tile::{eviction_order, load_order, TileCoordinate, TileHandle, TileKey, TileState, TrackedTile};
use crate::{ResidencyError, ResidencyResult, TILE_SIZE_BYTES};

/// Result message of a background load
enum LoadCompletion {
    Tile {
        handle: TileHandle,
        key: TileKey,
        result: ResidencyResult<Vec<u8>>,
    },
    Packed {
        resource: ResourceId,
        registration: u64,
        face: CubeFace,
        result: ResidencyResult<Vec<u8>>,
    },
}

/// Tile payload waiting for the flush
struct PendingUpload {
    handle: Option<TileHandle>,
    resource: ResourceId,
    coordinate: TileCoordinate,
    data: Vec<u8>,
}

/// Counters for one `update_tiles` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: FrameNumber,
    pub samples: usize,
    pub tiles_created: usize,
    pub loads_dispatched: usize,
    pub loads_completed: usize,
    pub loads_failed: usize,
    pub tiles_mapped: usize,
    pub tiles_evicted: usize,
    pub tiles_discarded: usize,
    pub seen: usize,
    pub loading: usize,
    pub mapped: usize,
    pub active_loads: usize,
}

/// Residency core
pub struct TileTracker {
    config: ResidencyConfig,
    runtime: Handle,
    frames: FrameCounter,
    resources: BTreeMap<ResourceId, ManagedTiledResource>,
    registrations: u64,

    tiles: SlotMap<TileHandle, TrackedTile>,
    index: AHashMap<TileKey, TileHandle>,
    seen: VecDeque<TileHandle>,
    loading: VecDeque<TileHandle>,
    mapped: VecDeque<TileHandle>,
    pool: PhysicalTilePool,

    active_loads: usize,
    packed_loads: usize,
    completion_tx: Sender<LoadCompletion>,
    completion_rx: Receiver<LoadCompletion>,
    /// Completions received by `wait_for_loads` but not yet applied
    received: Vec<LoadCompletion>,
    /// Mapping changes not yet accepted by the device
    pending_batches: BTreeMap<ResourceId, TileMappingBatch>,
    /// Payloads not yet uploaded, packed mips included
    pending_uploads: VecDeque<PendingUpload>,
}

impl TileTracker {
    /// Create a tracker whose loads run on `runtime`
    pub fn new(config: ResidencyConfig, runtime: Handle) -> ResidencyResult<Self> {
        config.validate()?;
        let (completion_tx, completion_rx) = channel::unbounded();

        log::debug!(
            "Tile tracker: {} pool tiles ({} reserved), {} concurrent loads, {} maps per frame",
            config.pool_capacity,
            config.reserved_tiles,
            config.max_simultaneous_file_load_tasks,
            config.max_tiles_loaded_per_frame
        );

        Ok(Self {
            pool: PhysicalTilePool::new(config.pool_capacity, config.reserved_tiles),
            config,
            runtime,
            frames: FrameCounter::new(),
            resources: BTreeMap::new(),
            registrations: 0,
            tiles: SlotMap::with_key(),
            index: AHashMap::new(),
            seen: VecDeque::new(),
            loading: VecDeque::new(),
            mapped: VecDeque::new(),
            active_loads: 0,
            packed_loads: 0,
            completion_tx,
            completion_rx,
            received: Vec::new(),
            pending_batches: BTreeMap::new(),
            pending_uploads: VecDeque::new(),
        })
    }

    /// Start managing a sparse texture the device already created.
    ///
    /// Maps the packed mips into the reserved region, starts their loads and
    /// uploads the initial residency shadow.
    pub fn register_resource(
        &mut self,
        id: ResourceId,
        name: impl Into<String>,
        source: Arc<dyn TileSource>,
        device: &mut dyn TiledResourceDevice,
    ) -> ResidencyResult<()> {
        if self.resources.contains_key(&id) {
            return Err(ResidencyError::DuplicateResource(id));
        }
        let geometry = device.query_tiling(id)?;
        geometry.validate()?;

        let needed = geometry.tiles_for_packed_mips * tessera_core::CUBE_FACE_COUNT as u32;
        let packed_slots = self
            .pool
            .allocate_reserved(needed)
            .ok_or(ResidencyError::ReservedExhausted {
                needed,
                available: self.pool.reserved_available(),
            })?;

        self.registrations += 1;
        let mut resource = ManagedTiledResource::new(id, name.into(), geometry, source, packed_slots, self.registrations);

        let mut batch = TileMappingBatch::default();
        for face in CubeFace::ALL {
            for (coordinate, slot) in resource.packed_tiles(face) {
                batch.push(TileMappingUpdate::map(coordinate, slot));
            }
        }
        let published = batch.submit(id, device).and_then(|_| {
            resource.shadow_mut().take_dirty();
            device.upload_residency_shadow(id, resource.shadow().faces())
        });
        if let Err(e) = published {
            self.pool.release_reserved(resource.packed_slots());
            return Err(e);
        }

        log::info!(
            "Registered resource {} '{}': {} tiles, {} mips ({} packed into {} tiles per face)",
            id,
            resource.name(),
            resource.geometry().total_tile_count,
            resource.geometry().mip_levels,
            resource.geometry().mip_levels - resource.geometry().packed_mip_cutoff,
            resource.geometry().tiles_for_packed_mips
        );

        let frame = self.frames.current();
        self.packed_loads += dispatch_packed(&self.runtime, &self.completion_tx, &mut resource, frame);
        self.resources.insert(id, resource);
        Ok(())
    }

    /// Stop managing a texture: drop its tiles and release their slots
    pub fn unregister_resource(
        &mut self,
        id: ResourceId,
        device: &mut dyn TiledResourceDevice,
    ) -> ResidencyResult<ManagedTiledResource> {
        let resource = self.resources.remove(&id).ok_or(ResidencyError::UnknownResource(id))?;

        let doomed: Vec<TileHandle> = self
            .tiles
            .iter()
            .filter(|(_, tile)| tile.key.resource == id)
            .map(|(handle, _)| handle)
            .collect();

        // unsubmitted changes go out ahead of the unmaps
        let mut batch = self.pending_batches.remove(&id).unwrap_or_default();
        for handle in doomed {
            if let Some(tile) = self.tiles.remove(handle) {
                self.index.remove(&tile.key);
                if let Some(offset) = tile.physical_offset {
                    self.pool.release(offset);
                    batch.push(TileMappingUpdate::unmap(tile.key.coordinate));
                }
            }
        }
        for face in CubeFace::ALL {
            for (coordinate, _) in resource.packed_tiles(face) {
                batch.push(TileMappingUpdate::unmap(coordinate));
            }
        }

        let tiles = &self.tiles;
        for queue in [&mut self.seen, &mut self.loading, &mut self.mapped] {
            queue.retain(|handle| tiles.contains_key(*handle));
        }
        self.pending_uploads.retain(|upload| upload.resource != id);
        self.pool.release_reserved(resource.packed_slots());

        batch.submit(id, device)?;
        log::info!("Unregistered resource {} '{}'", id, resource.name());
        Ok(resource)
    }

    /// Run one frame of residency management
    pub fn update_tiles(
        &mut self,
        samples: &[DecodedSample],
        device: &mut dyn TiledResourceDevice,
    ) -> ResidencyResult<FrameStats> {
        let frame = self.frames.advance();
        let mut stats = FrameStats {
            frame,
            samples: samples.len(),
            ..FrameStats::default()
        };

        self.drain_completions(frame, &mut stats);
        self.ingest(samples, frame, &mut stats);
        self.sort_queues();
        self.dispatch_loads(frame, &mut stats);

        self.map_and_evict(&mut stats);
        self.flush(device)?;

        stats.seen = self.seen.len();
        stats.loading = self.loading.len();
        stats.mapped = self.mapped.len();
        stats.active_loads = self.active_loads;

        log::debug!(
            "Frame {}: {} samples, {} new, {} dispatched, {} mapped, {} evicted, {} discarded ({} resident)",
            frame,
            stats.samples,
            stats.tiles_created,
            stats.loads_dispatched,
            stats.tiles_mapped,
            stats.tiles_evicted,
            stats.tiles_discarded,
            stats.mapped
        );
        Ok(stats)
    }

    /// Block until every in-flight load has reported back or `timeout` passes.
    ///
    /// Results are applied by the next `update_tiles`. Returns whether all
    /// loads finished.
    pub fn wait_for_loads(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.received.len() < self.active_loads + self.packed_loads {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completion_rx.recv_timeout(remaining) {
                Ok(completion) => self.received.push(completion),
                Err(_) => return false,
            }
        }
        true
    }

    fn drain_completions(&mut self, frame: FrameNumber, stats: &mut FrameStats) {
        let mut completions = std::mem::take(&mut self.received);
        completions.extend(self.completion_rx.try_iter());

        for completion in completions {
            match completion {
                LoadCompletion::Tile { handle, key, result } => {
                    self.active_loads = self.active_loads.saturating_sub(1);
                    self.complete_tile(handle, key, result, frame, stats);
                }
                LoadCompletion::Packed {
                    resource,
                    registration,
                    face,
                    result,
                } => {
                    self.packed_loads = self.packed_loads.saturating_sub(1);
                    self.complete_packed(resource, registration, face, result, frame);
                }
            }
        }
    }

    fn complete_tile(
        &mut self,
        handle: TileHandle,
        key: TileKey,
        result: ResidencyResult<Vec<u8>>,
        frame: FrameNumber,
        stats: &mut FrameStats,
    ) {
        // dropped while the load was in flight
        let Some(tile) = self.tiles.get_mut(handle) else {
            return;
        };
        if tile.key != key || tile.state != TileState::Loading {
            return;
        }

        let result = result.and_then(|data| {
            if data.len() == TILE_SIZE_BYTES {
                Ok(data)
            } else {
                Err(ResidencyError::InvalidTileSize {
                    expected: TILE_SIZE_BYTES,
                    actual: data.len(),
                })
            }
        });

        match result {
            Ok(data) => {
                tile.data = Some(data);
                tile.state = TileState::Loaded;
                tile.failed_loads = 0;
                stats.loads_completed += 1;
            }
            Err(e) => {
                tile.failed_loads += 1;
                let backoff = self.config.retry.backoff_frames(tile.failed_loads);
                tile.retry_after = frame.saturating_add(backoff);
                tile.state = TileState::Seen;
                log::warn!(
                    "Load of {} tile {} failed ({} in a row), retrying in {} frames: {}",
                    key.resource,
                    key.coordinate,
                    tile.failed_loads,
                    backoff,
                    e
                );
                stats.loads_failed += 1;

                self.loading.retain(|h| *h != handle);
                self.seen.push_back(handle);
            }
        }
    }

    fn complete_packed(
        &mut self,
        id: ResourceId,
        registration: u64,
        face: CubeFace,
        result: ResidencyResult<Vec<u8>>,
        frame: FrameNumber,
    ) {
        let Some(resource) = self.resources.get_mut(&id) else {
            return;
        };
        if resource.registration() != registration {
            return;
        }

        let expected = resource.geometry().tiles_for_packed_mips as usize * TILE_SIZE_BYTES;
        let result = result.and_then(|data| {
            if data.len() == expected {
                Ok(data)
            } else {
                Err(ResidencyError::InvalidTileSize {
                    expected,
                    actual: data.len(),
                })
            }
        });

        match result {
            Ok(data) => {
                for ((coordinate, _), chunk) in resource.packed_tiles(face).zip(data.chunks_exact(TILE_SIZE_BYTES)) {
                    self.pending_uploads.push_back(PendingUpload {
                        handle: None,
                        resource: id,
                        coordinate,
                        data: chunk.to_vec(),
                    });
                }
                resource.set_packed_state(face, PackedState::Resident);
                log::debug!("Packed mips of {} face {} loaded", id, face);
            }
            Err(e) => {
                let failures = match resource.packed_state(face) {
                    PackedState::Idle { failures, .. } => failures + 1,
                    _ => 1,
                };
                let backoff = self.config.retry.backoff_frames(failures);
                resource.set_packed_state(
                    face,
                    PackedState::Idle {
                        failures,
                        retry_after: frame.saturating_add(backoff),
                    },
                );
                log::warn!(
                    "Packed mip load of {} face {} failed, retrying in {} frames: {}",
                    id,
                    face,
                    backoff,
                    e
                );
            }
        }
    }

    fn ingest(&mut self, samples: &[DecodedSample], frame: FrameNumber, stats: &mut FrameStats) {
        for sample in samples {
            for (&id, resource) in &self.resources {
                let geometry = resource.geometry();
                for mip in sample.mip..geometry.packed_mip_cutoff {
                    let Some(coordinate) = geometry.tile_for_uv(sample.face, mip, sample.uv()) else {
                        continue;
                    };
                    let key = TileKey::new(id, coordinate);

                    match self.index.get(&key) {
                        Some(&handle) => {
                            if let Some(tile) = self.tiles.get_mut(handle) {
                                tile.touch(frame);
                            }
                        }
                        None => {
                            let handle = self.tiles.insert(TrackedTile::new(key, mip, sample.face, frame));
                            self.index.insert(key, handle);
                            self.seen.push_back(handle);
                            stats.tiles_created += 1;
                        }
                    }
                }
            }
        }
    }

    fn sort_queues(&mut self) {
        let tiles = &self.tiles;
        let (seen, loading, mapped) = (&mut self.seen, &mut self.loading, &mut self.mapped);

        rayon::join(
            || sort_queue(seen, tiles, load_order),
            || {
                rayon::join(
                    || sort_queue(loading, tiles, load_order),
                    || sort_queue(mapped, tiles, eviction_order),
                )
            },
        );
    }

    fn dispatch_loads(&mut self, frame: FrameNumber, stats: &mut FrameStats) {
        let limit = self.config.max_simultaneous_file_load_tasks;
        let mut waiting = VecDeque::with_capacity(self.seen.len());

        while let Some(handle) = self.seen.pop_front() {
            if self.active_loads >= limit {
                waiting.push_back(handle);
                waiting.extend(self.seen.drain(..));
                break;
            }
            let Some(tile) = self.tiles.get_mut(handle) else {
                continue;
            };
            if !tile.ready_for_load(frame) {
                waiting.push_back(handle);
                continue;
            }
            let Some(resource) = self.resources.get(&tile.key.resource) else {
                continue;
            };

            let key = tile.key;
            let load = spawn_guarded(&self.runtime, resource.source().load_tile_async(key.coordinate));
            let sender = self.completion_tx.clone();
            self.runtime.spawn(async move {
                let result = load.await;
                let _ = sender.send(LoadCompletion::Tile { handle, key, result });
            });

            tile.state = TileState::Loading;
            self.active_loads += 1;
            self.loading.push_back(handle);
            stats.loads_dispatched += 1;
        }
        self.seen = waiting;

        for resource in self.resources.values_mut() {
            self.packed_loads += dispatch_packed(&self.runtime, &self.completion_tx, resource, frame);
        }
    }

    fn map_and_evict(&mut self, stats: &mut FrameStats) {
        for _ in 0..self.config.max_tiles_loaded_per_frame {
            let Some(&candidate) = self.loading.front() else {
                break;
            };
            if self.tiles.get(candidate).map(|t| t.state) != Some(TileState::Loaded) {
                break;
            }
            self.loading.pop_front();

            let offset = match self.pool.allocate() {
                Some(slot) => slot,
                None => {
                    let victim = match self.mapped.front().copied() {
                        Some(victim) if !self.is_stale(candidate, victim) => victim,
                        _ => {
                            self.discard(candidate);
                            stats.tiles_discarded += 1;
                            continue;
                        }
                    };
                    self.mapped.pop_front();
                    match self.evict(victim) {
                        Some(offset) => {
                            stats.tiles_evicted += 1;
                            offset
                        }
                        None => {
                            self.discard(candidate);
                            stats.tiles_discarded += 1;
                            continue;
                        }
                    }
                }
            };

            self.map(candidate, offset);
            stats.tiles_mapped += 1;
        }
    }

    /// Whether `candidate` was last seen before the eviction head
    fn is_stale(&self, candidate: TileHandle, victim: TileHandle) -> bool {
        match (self.tiles.get(candidate), self.tiles.get(victim)) {
            (Some(c), Some(v)) => c.last_seen < v.last_seen,
            _ => true,
        }
    }

    fn discard(&mut self, handle: TileHandle) {
        if let Some(tile) = self.tiles.remove(handle) {
            self.index.remove(&tile.key);
        }
    }

    fn evict(&mut self, handle: TileHandle) -> Option<u32> {
        let tile = self.tiles.remove(handle)?;
        self.index.remove(&tile.key);
        let offset = tile.physical_offset?;

        self.pending_batches
            .entry(tile.key.resource)
            .or_default()
            .push(TileMappingUpdate::unmap(tile.key.coordinate));
        if let Some(resource) = self.resources.get_mut(&tile.key.resource) {
            let footprint = resource
                .geometry()
                .footprint(tile.mip, tile.key.coordinate.x, tile.key.coordinate.y);
            resource.shadow_mut().on_evicted(tile.face, footprint, tile.mip);
        }
        // mapped but never uploaded
        self.pending_uploads.retain(|upload| upload.handle != Some(handle));

        Some(offset)
    }

    fn map(&mut self, handle: TileHandle, offset: u32) {
        let Some(tile) = self.tiles.get_mut(handle) else {
            self.pool.release(offset);
            return;
        };
        tile.state = TileState::Mapped;
        tile.physical_offset = Some(offset);

        let key = tile.key;
        self.pending_batches
            .entry(key.resource)
            .or_default()
            .push(TileMappingUpdate::map(key.coordinate, offset));
        if let Some(data) = tile.data.take() {
            self.pending_uploads.push_back(PendingUpload {
                handle: Some(handle),
                resource: key.resource,
                coordinate: key.coordinate,
                data,
            });
        }
        if let Some(resource) = self.resources.get_mut(&key.resource) {
            let footprint = resource.geometry().footprint(tile.mip, key.coordinate.x, key.coordinate.y);
            resource.shadow_mut().on_mapped(tile.face, footprint, tile.mip);
        }

        // keep the eviction head valid for the rest of this frame
        let tiles = &self.tiles;
        let tile = &tiles[handle];
        let position = self.mapped.partition_point(|other| {
            tiles
                .get(*other)
                .is_some_and(|o| eviction_order(o, tile) == Ordering::Less)
        });
        self.mapped.insert(position, handle);
    }

    /// Hand pending work to the device.
    ///
    /// Each batch, upload and shadow is retired only once the device accepts
    /// it; whatever is left after an error goes out with the next frame.
    fn flush(&mut self, device: &mut dyn TiledResourceDevice) -> ResidencyResult<()> {
        while let Some(entry) = self.pending_batches.first_entry() {
            entry.get().submit(*entry.key(), device)?;
            entry.remove();
        }

        while let Some(upload) = self.pending_uploads.front() {
            device.upload_tile_data(upload.resource, upload.coordinate, &upload.data)?;
            self.pending_uploads.pop_front();
        }

        for (id, resource) in &mut self.resources {
            if resource.shadow().is_dirty() {
                device.upload_residency_shadow(*id, resource.shadow().faces())?;
                resource.shadow_mut().take_dirty();
            }
        }
        Ok(())
    }

    /// Number of the most recent frame
    pub fn current_frame(&self) -> FrameNumber {
        self.frames.current()
    }

    pub fn config(&self) -> &ResidencyConfig {
        &self.config
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ManagedTiledResource> {
        self.resources.get(&id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ManagedTiledResource> {
        self.resources.values()
    }

    pub fn pool(&self) -> &PhysicalTilePool {
        &self.pool
    }

    /// Tracked tile with the given key
    pub fn tile(&self, key: &TileKey) -> Option<&TrackedTile> {
        self.index.get(key).and_then(|handle| self.tiles.get(*handle))
    }

    /// Lifecycle state of a tracked tile
    pub fn tile_state(&self, key: &TileKey) -> Option<TileState> {
        self.tile(key).map(|tile| tile.state)
    }

    /// Every tracked tile
    pub fn tiles(&self) -> impl Iterator<Item = &TrackedTile> {
        self.tiles.values()
    }

    /// Mapped tiles, next eviction candidate first as of the last sort
    pub fn mapped_tiles(&self) -> impl Iterator<Item = &TrackedTile> {
        self.mapped.iter().filter_map(|handle| self.tiles.get(*handle))
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn loading_len(&self) -> usize {
        self.loading.len()
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped.len()
    }

    /// Tile loads in flight
    pub fn active_loads(&self) -> usize {
        self.active_loads
    }
}

/// Start packed-mip loads for every face that is due; returns how many started
fn dispatch_packed(
    runtime: &Handle,
    completions: &Sender<LoadCompletion>,
    resource: &mut ManagedTiledResource,
    frame: FrameNumber,
) -> usize {
    let mut started = 0;
    for face in CubeFace::ALL {
        if !resource.packed_state(face).ready_for_load(frame) {
            continue;
        }

        let load = spawn_guarded(runtime, resource.source().load_packed_async(face));
        let sender = completions.clone();
        let id = resource.id();
        let registration = resource.registration();
        runtime.spawn(async move {
            let result = load.await;
            let _ = sender.send(LoadCompletion::Packed {
                resource: id,
                registration,
                face,
                result,
            });
        });

        resource.set_packed_state(face, PackedState::Loading);
        started += 1;
    }
    started
}

/// Run a load on its own task; a panic or cancellation resolves to a failed load
fn spawn_guarded(
    runtime: &Handle,
    load: TileFuture,
) -> impl std::future::Future<Output = ResidencyResult<Vec<u8>>> + Send + 'static {
    let task = runtime.spawn(load);
    async move {
        task.await
            .unwrap_or_else(|e| Err(ResidencyError::LoadFailed(format!("load task did not finish: {}", e))))
    }
}

fn sort_queue(
    queue: &mut VecDeque<TileHandle>,
    tiles: &SlotMap<TileHandle, TrackedTile>,
    order: fn(&TrackedTile, &TrackedTile) -> Ordering,
) {
    queue.retain(|handle| tiles.contains_key(*handle));
    queue
        .make_contiguous()
        .sort_by(|a, b| order(&tiles[*a], &tiles[*b]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingDevice;
    use crate::geometry::TilingGeometry;
    use crate::source::MemoryTileSource;
    use tessera_core::math::Vec2;

    const WAIT: Duration = Duration::from_secs(5);

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn config(capacity: u32, reserved: u32) -> ResidencyConfig {
        ResidencyConfig {
            pool_capacity: capacity,
            reserved_tiles: reserved,
            max_simultaneous_file_load_tasks: 8,
            max_tiles_loaded_per_frame: 8,
            ..ResidencyConfig::default()
        }
    }

    fn setup(
        rt: &tokio::runtime::Runtime,
        config: ResidencyConfig,
        geometry: TilingGeometry,
    ) -> (TileTracker, RecordingDevice, Arc<MemoryTileSource>) {
        let mut device = RecordingDevice::new();
        device.define_resource(ResourceId(1), geometry.clone());
        let source = Arc::new(MemoryTileSource::new(geometry));
        let mut tracker = TileTracker::new(config, rt.handle().clone()).unwrap();
        tracker
            .register_resource(ResourceId(1), "test", source.clone(), &mut device)
            .unwrap();
        (tracker, device, source)
    }

    /// Device whose next few mapping or upload calls fail
    struct FlakyDevice {
        inner: RecordingDevice,
        failing_mappings: usize,
        failing_uploads: usize,
    }

    impl FlakyDevice {
        fn new(geometry: TilingGeometry) -> Self {
            let mut inner = RecordingDevice::new();
            inner.define_resource(ResourceId(1), geometry);
            Self {
                inner,
                failing_mappings: 0,
                failing_uploads: 0,
            }
        }

        fn tile_uploads(&self) -> Vec<(TileCoordinate, usize, bool)> {
            self.inner
                .commands()
                .iter()
                .filter_map(|c| match c {
                    crate::device::DeviceCommand::UploadTileData {
                        coordinate, len, mapped, ..
                    } => Some((*coordinate, *len, *mapped)),
                    _ => None,
                })
                .collect()
        }
    }

    fn take_failure(remaining: &mut usize) -> ResidencyResult<()> {
        if *remaining > 0 {
            *remaining -= 1;
            return Err(ResidencyError::Device("device lost".into()));
        }
        Ok(())
    }

    impl TiledResourceDevice for FlakyDevice {
        fn query_tiling(&self, resource: ResourceId) -> ResidencyResult<TilingGeometry> {
            self.inner.query_tiling(resource)
        }

        fn update_tile_mappings(
            &mut self,
            resource: ResourceId,
            coordinates: &[TileCoordinate],
            physical_offsets: &[u32],
            flags: &[crate::device::TileRangeFlags],
        ) -> ResidencyResult<()> {
            take_failure(&mut self.failing_mappings)?;
            self.inner.update_tile_mappings(resource, coordinates, physical_offsets, flags)
        }

        fn resource_barrier(&mut self, resource: ResourceId) -> ResidencyResult<()> {
            self.inner.resource_barrier(resource)
        }

        fn upload_tile_data(&mut self, resource: ResourceId, coordinate: TileCoordinate, bytes: &[u8]) -> ResidencyResult<()> {
            take_failure(&mut self.failing_uploads)?;
            self.inner.upload_tile_data(resource, coordinate, bytes)
        }

        fn upload_residency_shadow(
            &mut self,
            resource: ResourceId,
            faces: &[Vec<u8>; tessera_core::CUBE_FACE_COUNT],
        ) -> ResidencyResult<()> {
            self.inner.upload_residency_shadow(resource, faces)
        }
    }

    /// Source whose first few tile loads panic
    struct PanickingSource {
        inner: MemoryTileSource,
        panics_left: std::sync::atomic::AtomicUsize,
    }

    impl TileSource for PanickingSource {
        fn load_tile_async(&self, coordinate: TileCoordinate) -> TileFuture {
            use std::sync::atomic::Ordering::SeqCst;
            let panics = self
                .panics_left
                .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let load = self.inner.load_tile_async(coordinate);
            Box::pin(async move {
                if panics {
                    panic!("corrupt tile stream at {}", coordinate);
                }
                load.await
            })
        }

        fn load_packed_async(&self, face: CubeFace) -> TileFuture {
            self.inner.load_packed_async(face)
        }
    }

    fn sample(face: CubeFace, u: f32, v: f32, mip: u32) -> DecodedSample {
        DecodedSample { u, v, mip, face }
    }

    fn key(subresource: u32, x: u32, y: u32) -> TileKey {
        TileKey::new(ResourceId(1), TileCoordinate::new(subresource, x, y))
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let rt = runtime();
        let config = ResidencyConfig {
            max_simultaneous_file_load_tasks: 0,
            ..ResidencyConfig::default()
        };
        assert!(matches!(
            TileTracker::new(config, rt.handle().clone()),
            Err(ResidencyError::Config(_))
        ));
    }

    #[test]
    fn test_ingest_touches_coarser_mips() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(4, 4, 4, 3, 1).unwrap();
        let (mut tracker, mut device, source) = setup(&rt, config(32, 6), geometry);
        source.hold_all();

        let stats = tracker
            .update_tiles(&[sample(CubeFace::PositiveX, 0.9, 0.1, 0)], &mut device)
            .unwrap();

        // mips 0, 1, 2; mip 3 is packed
        assert_eq!(stats.tiles_created, 3);
        assert!(tracker.tile(&key(0, 3, 0)).is_some());
        assert!(tracker.tile(&key(1, 1, 0)).is_some());
        assert!(tracker.tile(&key(2, 0, 0)).is_some());
        assert_eq!(tracker.tiles().count(), 3);

        source.open_gate();
        assert!(tracker.wait_for_loads(WAIT));
    }

    #[test]
    fn test_packed_sample_creates_no_tiles() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(4, 4, 4, 2, 1).unwrap();
        let (mut tracker, mut device, _source) = setup(&rt, config(32, 6), geometry);

        let stats = tracker
            .update_tiles(&[sample(CubeFace::NegativeY, 0.5, 0.5, 3)], &mut device)
            .unwrap();
        assert_eq!(stats.tiles_created, 0);
        assert!(tracker.wait_for_loads(WAIT));
    }

    #[test]
    fn test_load_then_map() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let (mut tracker, mut device, _source) = setup(&rt, config(8, 0), geometry);

        let samples = [sample(CubeFace::PositiveZ, 0.1, 0.1, 0)];
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_dispatched, 1);
        assert_eq!(tracker.tile_state(&key(4, 0, 0)), Some(TileState::Loading));

        assert!(tracker.wait_for_loads(WAIT));
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_completed, 1);
        assert_eq!(stats.tiles_mapped, 1);

        let tile = tracker.tile(&key(4, 0, 0)).unwrap();
        assert_eq!(tile.state, TileState::Mapped);
        assert!(tile.data.is_none());
        assert_eq!(device.mapped_offset(ResourceId(1), TileCoordinate::new(4, 0, 0)), tile.physical_offset);

        let shadow = tracker.resource(ResourceId(1)).unwrap().shadow();
        assert_eq!(shadow.value(CubeFace::PositiveZ, 0, 0), 0);
        assert_eq!(shadow.value(CubeFace::PositiveZ, 1, 1), 16);
        assert_eq!(device.shadow(ResourceId(1)).unwrap()[4][0], 0);
    }

    #[test]
    fn test_concurrency_limit() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(8, 8, 1, 1, 0).unwrap();
        let mut config = config(128, 0);
        config.max_simultaneous_file_load_tasks = 3;
        let (mut tracker, mut device, source) = setup(&rt, config, geometry);
        source.hold_all();

        let samples: Vec<_> = (0..8)
            .map(|i| sample(CubeFace::PositiveX, (i as f32 + 0.5) / 8.0, 0.5, 0))
            .collect();
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_dispatched, 3);
        assert_eq!(tracker.active_loads(), 3);
        assert_eq!(tracker.seen_len(), 5);

        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_dispatched, 0);

        source.open_gate();
        assert!(tracker.wait_for_loads(WAIT));
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.tiles_mapped, 3);
        assert_eq!(stats.loads_dispatched, 3);
    }

    #[test]
    fn test_failed_load_backs_off() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let mut config = config(8, 0);
        config.retry.base_backoff_frames = 3;
        let (mut tracker, mut device, source) = setup(&rt, config, geometry);

        let coordinate = TileCoordinate::new(0, 0, 0);
        source.fail(coordinate);
        let samples = [sample(CubeFace::PositiveX, 0.1, 0.1, 0)];

        tracker.update_tiles(&samples, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));

        // frame 2: failure applied, retry after frame 5
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_failed, 1);
        let tile = tracker.tile(&key(0, 0, 0)).unwrap();
        assert_eq!(tile.state, TileState::Seen);
        assert_eq!(tile.retry_after, 5);

        source.clear_failure(coordinate);
        for _ in 3..5 {
            let stats = tracker.update_tiles(&samples, &mut device).unwrap();
            assert_eq!(stats.loads_dispatched, 0);
        }
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_dispatched, 1);

        assert!(tracker.wait_for_loads(WAIT));
        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.tiles_mapped, 1);
        assert_eq!(tracker.tile(&key(0, 0, 0)).unwrap().failed_loads, 0);
    }

    #[test]
    fn test_packed_mips_mapped_at_registration() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(4, 4, 5, 2, 2).unwrap();
        let (mut tracker, mut device, _source) = setup(&rt, config(32, 16), geometry.clone());

        let resource = tracker.resource(ResourceId(1)).unwrap();
        assert_eq!(resource.packed_slots(), 0..12);
        let packed = TileCoordinate::new(geometry.subresource_index(CubeFace::NegativeZ, 2), 1, 0);
        assert_eq!(device.mapped_offset(ResourceId(1), packed), Some(11));
        assert_eq!(tracker.pool().reserved_available(), 4);

        assert!(tracker.wait_for_loads(WAIT));
        tracker.update_tiles(&[], &mut device).unwrap();
        assert!(tracker.resource(ResourceId(1)).unwrap().packed_resident());

        let uploads = device
            .commands()
            .iter()
            .filter(|c| matches!(c, crate::device::DeviceCommand::UploadTileData { mapped: true, .. }))
            .count();
        assert_eq!(uploads, 12);
    }

    #[test]
    fn test_reserved_exhausted() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(4, 4, 5, 2, 2).unwrap();
        let mut device = RecordingDevice::new();
        device.define_resource(ResourceId(1), geometry.clone());
        let mut tracker = TileTracker::new(config(32, 8), rt.handle().clone()).unwrap();

        let result = tracker.register_resource(
            ResourceId(1),
            "too big",
            Arc::new(MemoryTileSource::new(geometry)),
            &mut device,
        );
        assert!(matches!(
            result,
            Err(ResidencyError::ReservedExhausted { needed: 12, available: 8 })
        ));
        assert!(tracker.resource(ResourceId(1)).is_none());
    }

    #[test]
    fn test_duplicate_and_unknown_resources() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let (mut tracker, mut device, source) = setup(&rt, config(8, 0), geometry);

        let result = tracker.register_resource(ResourceId(1), "again", source, &mut device);
        assert!(matches!(result, Err(ResidencyError::DuplicateResource(_))));
        assert!(matches!(
            tracker.unregister_resource(ResourceId(2), &mut device),
            Err(ResidencyError::UnknownResource(_))
        ));
    }

    #[test]
    fn test_unregister_releases_slots() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 2, 1, 1).unwrap();
        let (mut tracker, mut device, _source) = setup(&rt, config(16, 6), geometry);

        let samples = [
            sample(CubeFace::PositiveX, 0.1, 0.1, 0),
            sample(CubeFace::PositiveX, 0.9, 0.9, 0),
        ];
        tracker.update_tiles(&samples, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));
        tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(tracker.mapped_len(), 2);
        assert_eq!(device.mapped_count(), 8);

        let resource = tracker.unregister_resource(ResourceId(1), &mut device).unwrap();
        assert_eq!(resource.name(), "test");
        assert_eq!(tracker.tiles().count(), 0);
        assert_eq!(tracker.mapped_len(), 0);
        assert_eq!(tracker.pool().in_use(), 0);
        assert_eq!(tracker.pool().reserved_available(), 6);
        assert_eq!(device.mapped_count(), 0);
    }

    #[test]
    fn test_eviction_raises_shadow() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let (mut tracker, mut device, _source) = setup(&rt, config(1, 0), geometry);

        let first = [sample(CubeFace::PositiveX, 0.1, 0.1, 0)];
        tracker.update_tiles(&first, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));
        tracker.update_tiles(&first, &mut device).unwrap();
        assert_eq!(tracker.resource(ResourceId(1)).unwrap().shadow().value(CubeFace::PositiveX, 0, 0), 0);

        let second = [sample(CubeFace::PositiveX, 0.9, 0.9, 0)];
        tracker.update_tiles(&second, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));
        let stats = tracker.update_tiles(&second, &mut device).unwrap();
        assert_eq!(stats.tiles_evicted, 1);
        assert_eq!(stats.tiles_mapped, 1);

        let shadow = tracker.resource(ResourceId(1)).unwrap().shadow();
        assert_eq!(shadow.value(CubeFace::PositiveX, 0, 0), 16);
        assert_eq!(shadow.value(CubeFace::PositiveX, 1, 1), 0);
        assert!(tracker.tile(&key(0, 0, 0)).is_none());
        assert_eq!(tracker.tile_state(&key(0, 1, 1)), Some(TileState::Mapped));
    }

    #[test]
    fn test_failed_upload_is_retried() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let mut device = FlakyDevice::new(geometry.clone());
        let mut tracker = TileTracker::new(config(8, 0), rt.handle().clone()).unwrap();
        tracker
            .register_resource(ResourceId(1), "test", Arc::new(MemoryTileSource::new(geometry)), &mut device)
            .unwrap();

        let samples = [sample(CubeFace::PositiveX, 0.1, 0.1, 0)];
        let coordinate = TileCoordinate::new(0, 0, 0);
        tracker.update_tiles(&samples, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));

        device.failing_uploads = 1;
        assert!(tracker.update_tiles(&samples, &mut device).is_err());
        assert_eq!(tracker.tile_state(&key(0, 0, 0)), Some(TileState::Mapped));
        assert!(device.inner.mapped_offset(ResourceId(1), coordinate).is_some());
        assert!(device.tile_uploads().is_empty());

        tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(device.tile_uploads(), vec![(coordinate, TILE_SIZE_BYTES, true)]);
        assert_eq!(device.inner.shadow(ResourceId(1)).unwrap()[0][0], 0);

        // nothing left over for later frames
        tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(device.tile_uploads().len(), 1);
    }

    #[test]
    fn test_failed_mapping_is_resubmitted() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let mut device = FlakyDevice::new(geometry.clone());
        let mut tracker = TileTracker::new(config(8, 0), rt.handle().clone()).unwrap();
        tracker
            .register_resource(ResourceId(1), "test", Arc::new(MemoryTileSource::new(geometry)), &mut device)
            .unwrap();

        let samples = [sample(CubeFace::NegativeZ, 0.9, 0.1, 0)];
        let coordinate = TileCoordinate::new(5, 1, 0);
        tracker.update_tiles(&samples, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));

        device.failing_mappings = 1;
        assert!(tracker.update_tiles(&samples, &mut device).is_err());
        assert_eq!(device.inner.mapped_offset(ResourceId(1), coordinate), None);

        tracker.update_tiles(&samples, &mut device).unwrap();
        let offset = tracker.tile(&key(5, 1, 0)).unwrap().physical_offset;
        assert!(offset.is_some());
        assert_eq!(device.inner.mapped_offset(ResourceId(1), coordinate), offset);
        assert_eq!(device.tile_uploads(), vec![(coordinate, TILE_SIZE_BYTES, true)]);
    }

    #[test]
    fn test_panicking_load_is_retried() {
        let rt = runtime();
        let geometry = TilingGeometry::cube(2, 2, 1, 1, 0).unwrap();
        let mut device = RecordingDevice::new();
        device.define_resource(ResourceId(1), geometry.clone());
        let mut config = config(8, 0);
        config.retry.base_backoff_frames = 1;
        let mut tracker = TileTracker::new(config, rt.handle().clone()).unwrap();
        let source = PanickingSource {
            inner: MemoryTileSource::new(geometry),
            panics_left: std::sync::atomic::AtomicUsize::new(1),
        };
        tracker
            .register_resource(ResourceId(1), "test", Arc::new(source), &mut device)
            .unwrap();

        let samples = [sample(CubeFace::PositiveY, 0.1, 0.9, 0)];
        tracker.update_tiles(&samples, &mut device).unwrap();
        assert!(tracker.wait_for_loads(WAIT));

        let stats = tracker.update_tiles(&samples, &mut device).unwrap();
        assert_eq!(stats.loads_failed, 1);
        assert_eq!(tracker.active_loads(), 0);
        assert_eq!(tracker.tile_state(&key(2, 0, 1)), Some(TileState::Seen));

        for _ in 0..8 {
            assert!(tracker.wait_for_loads(WAIT));
            tracker.update_tiles(&samples, &mut device).unwrap();
        }
        assert_eq!(tracker.tile_state(&key(2, 0, 1)), Some(TileState::Mapped));
    }

    #[test]
    fn test_invalid_reported_geometry_is_rejected() {
        let rt = runtime();
        let mut device = RecordingDevice::new();
        device.define_resource(
            ResourceId(1),
            TilingGeometry {
                mip_levels: 0,
                packed_mip_cutoff: 0,
                tiles_for_packed_mips: 0,
                subresources: Vec::new(),
                total_tile_count: 0,
            },
        );
        let mut tracker = TileTracker::new(config(8, 4), rt.handle().clone()).unwrap();
        let source = Arc::new(MemoryTileSource::new(TilingGeometry::cube(2, 2, 1, 1, 0).unwrap()));

        let result = tracker.register_resource(ResourceId(1), "broken", source, &mut device);
        assert!(matches!(result, Err(ResidencyError::InvalidGeometry(_))));
        assert!(tracker.resource(ResourceId(1)).is_none());
        assert_eq!(tracker.pool().reserved_available(), 4);
        assert!(device.commands().is_empty());
    }

    #[test]
    fn test_sample_uv_lookup_uses_requested_mip() {
        let geometry = TilingGeometry::cube(8, 8, 3, 3, 0).unwrap();
        let s = sample(CubeFace::NegativeX, 0.8, 0.3, 1);
        let tile = geometry.tile_for_uv(s.face, s.mip, Vec2::new(s.u, s.v)).unwrap();
        assert_eq!(tile, TileCoordinate::new(4, 3, 1));
    }
}
