//! GPU Tiled-Resource Boundary
//!
//! Everything the residency manager asks of the graphics API: tiling queries,
//! coalesced mapping updates, tile uploads and residency map uploads. A real
//! backend implements [`TiledResourceDevice`] on top of its sparse-binding API;
//! [`RecordingDevice`] records the calls and mirrors the resulting mappings.

use ahash::AHashMap;
use bitflags::bitflags;
use smallvec::SmallVec;
use tessera_core::CUBE_FACE_COUNT;

use crate::geometry::TilingGeometry;
use crate::resource::ResourceId;
use crate::tile::TileCoordinate;
use crate::{ResidencyError, ResidencyResult};

bitflags! {
    /// Per-range flags of a mapping update
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TileRangeFlags: u32 {
        /// Unmap the range
        const NULL = 0x1;
        /// Map the whole range to a single physical tile
        const REUSE_SINGLE_TILE = 0x4;
    }
}

/// One map or unmap operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMappingUpdate {
    pub coordinate: TileCoordinate,
    pub physical_offset: u32,
    pub flags: TileRangeFlags,
}

impl TileMappingUpdate {
    /// Map `coordinate` to physical slot `offset`
    pub fn map(coordinate: TileCoordinate, offset: u32) -> Self {
        Self {
            coordinate,
            physical_offset: offset,
            flags: TileRangeFlags::REUSE_SINGLE_TILE,
        }
    }

    /// Unmap `coordinate`
    pub fn unmap(coordinate: TileCoordinate) -> Self {
        Self {
            coordinate,
            physical_offset: 0,
            flags: TileRangeFlags::NULL,
        }
    }
}

/// All mapping changes for one resource in one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileMappingBatch {
    pub updates: SmallVec<[TileMappingUpdate; 16]>,
}

impl TileMappingBatch {
    /// Append an update
    pub fn push(&mut self, update: TileMappingUpdate) {
        self.updates.push(update);
    }

    /// Whether the batch holds no updates
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Number of updates
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Split into the parallel arrays the mapping call takes
    pub fn to_arrays(&self) -> (Vec<TileCoordinate>, Vec<u32>, Vec<TileRangeFlags>) {
        let coordinates = self.updates.iter().map(|u| u.coordinate).collect();
        let offsets = self.updates.iter().map(|u| u.physical_offset).collect();
        let flags = self.updates.iter().map(|u| u.flags).collect();
        (coordinates, offsets, flags)
    }

    /// Submit the batch followed by a barrier; empty batches submit nothing
    pub fn submit(&self, resource: ResourceId, device: &mut dyn TiledResourceDevice) -> ResidencyResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        let (coordinates, offsets, flags) = self.to_arrays();
        device.update_tile_mappings(resource, &coordinates, &offsets, &flags)?;
        device.resource_barrier(resource)
    }
}

/// Sparse-texture operations consumed by the residency manager
pub trait TiledResourceDevice {
    /// Tiling of a sparse texture created by the renderer
    fn query_tiling(&self, resource: ResourceId) -> ResidencyResult<TilingGeometry>;

    /// Apply a coalesced set of map/unmap operations
    fn update_tile_mappings(
        &mut self,
        resource: ResourceId,
        coordinates: &[TileCoordinate],
        physical_offsets: &[u32],
        flags: &[TileRangeFlags],
    ) -> ResidencyResult<()>;

    /// Order the mapping update before subsequent access to the resource
    fn resource_barrier(&mut self, resource: ResourceId) -> ResidencyResult<()>;

    /// Copy one tile's payload into its mapped memory
    fn upload_tile_data(&mut self, resource: ResourceId, coordinate: TileCoordinate, bytes: &[u8]) -> ResidencyResult<()>;

    /// Replace the residency texture contents
    fn upload_residency_shadow(
        &mut self,
        resource: ResourceId,
        faces: &[Vec<u8>; CUBE_FACE_COUNT],
    ) -> ResidencyResult<()>;
}

/// A call received by [`RecordingDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    UpdateTileMappings {
        resource: ResourceId,
        updates: Vec<TileMappingUpdate>,
    },
    ResourceBarrier {
        resource: ResourceId,
    },
    UploadTileData {
        resource: ResourceId,
        coordinate: TileCoordinate,
        len: usize,
        /// Whether the coordinate was mapped when the upload arrived
        mapped: bool,
    },
    UploadResidencyShadow {
        resource: ResourceId,
    },
}

/// Headless device that records calls and tracks the resulting mappings
#[derive(Debug, Default)]
pub struct RecordingDevice {
    geometries: AHashMap<ResourceId, TilingGeometry>,
    mappings: AHashMap<(ResourceId, TileCoordinate), u32>,
    shadows: AHashMap<ResourceId, [Vec<u8>; CUBE_FACE_COUNT]>,
    commands: Vec<DeviceCommand>,
}

impl RecordingDevice {
    /// Create a device with no resources
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sparse texture with the given tiling
    pub fn define_resource(&mut self, resource: ResourceId, geometry: TilingGeometry) {
        self.geometries.insert(resource, geometry);
    }

    /// Every call received so far
    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    /// Drain the recorded calls
    pub fn take_commands(&mut self) -> Vec<DeviceCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Physical slot a tile is mapped to
    pub fn mapped_offset(&self, resource: ResourceId, coordinate: TileCoordinate) -> Option<u32> {
        self.mappings.get(&(resource, coordinate)).copied()
    }

    /// Number of mapped tiles across all resources
    pub fn mapped_count(&self) -> usize {
        self.mappings.len()
    }

    /// Whether every mapped tile has its own physical slot
    pub fn offsets_are_unique(&self) -> bool {
        let mut seen = ahash::AHashSet::with_capacity(self.mappings.len());
        self.mappings.values().all(|offset| seen.insert(*offset))
    }

    /// Last residency map uploaded for a resource
    pub fn shadow(&self, resource: ResourceId) -> Option<&[Vec<u8>; CUBE_FACE_COUNT]> {
        self.shadows.get(&resource)
    }

    fn check_resource(&self, resource: ResourceId) -> ResidencyResult<()> {
        if self.geometries.contains_key(&resource) {
            Ok(())
        } else {
            Err(ResidencyError::UnknownResource(resource))
        }
    }
}

impl TiledResourceDevice for RecordingDevice {
    fn query_tiling(&self, resource: ResourceId) -> ResidencyResult<TilingGeometry> {
        self.geometries
            .get(&resource)
            .cloned()
            .ok_or(ResidencyError::UnknownResource(resource))
    }

    fn update_tile_mappings(
        &mut self,
        resource: ResourceId,
        coordinates: &[TileCoordinate],
        physical_offsets: &[u32],
        flags: &[TileRangeFlags],
    ) -> ResidencyResult<()> {
        self.check_resource(resource)?;
        if coordinates.len() != physical_offsets.len() || coordinates.len() != flags.len() {
            return Err(ResidencyError::Device(format!(
                "mismatched mapping arrays: {} coordinates, {} offsets, {} flags",
                coordinates.len(),
                physical_offsets.len(),
                flags.len()
            )));
        }

        let mut updates = Vec::with_capacity(coordinates.len());
        for ((&coordinate, &physical_offset), &flags) in coordinates.iter().zip(physical_offsets).zip(flags) {
            if flags.contains(TileRangeFlags::NULL) {
                self.mappings.remove(&(resource, coordinate));
            } else {
                self.mappings.insert((resource, coordinate), physical_offset);
            }
            updates.push(TileMappingUpdate {
                coordinate,
                physical_offset,
                flags,
            });
        }

        self.commands.push(DeviceCommand::UpdateTileMappings { resource, updates });
        Ok(())
    }

    fn resource_barrier(&mut self, resource: ResourceId) -> ResidencyResult<()> {
        self.check_resource(resource)?;
        self.commands.push(DeviceCommand::ResourceBarrier { resource });
        Ok(())
    }

    fn upload_tile_data(&mut self, resource: ResourceId, coordinate: TileCoordinate, bytes: &[u8]) -> ResidencyResult<()> {
        self.check_resource(resource)?;
        let mapped = self.mappings.contains_key(&(resource, coordinate));
        self.commands.push(DeviceCommand::UploadTileData {
            resource,
            coordinate,
            len: bytes.len(),
            mapped,
        });
        Ok(())
    }

    fn upload_residency_shadow(
        &mut self,
        resource: ResourceId,
        faces: &[Vec<u8>; CUBE_FACE_COUNT],
    ) -> ResidencyResult<()> {
        self.check_resource(resource)?;
        self.shadows.insert(resource, faces.clone());
        self.commands.push(DeviceCommand::UploadResidencyShadow { resource });
        Ok(())
    }
}
