//! Managed Tiled Resources
//!
//! Per-texture state owned by the tracker: tiling, tile source, residency
//! shadow and the reserved pool slots backing the packed mips.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tessera_core::{CubeFace, FrameNumber, CUBE_FACE_COUNT};

use crate::geometry::TilingGeometry;
use crate::shadow::ResidencyShadow;
use crate::source::TileSource;
use crate::tile::TileCoordinate;

/// Identity of a sparse texture, chosen by the renderer that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Load state of one face's packed mips
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedState {
    /// Waiting for a load, possibly after failures
    Idle { failures: u32, retry_after: FrameNumber },
    /// Load in flight
    Loading,
    /// Uploaded, or nothing to upload
    Resident,
}

impl PackedState {
    /// Whether a load may be dispatched in `frame`
    pub fn ready_for_load(&self, frame: FrameNumber) -> bool {
        matches!(self, PackedState::Idle { retry_after, .. } if frame >= *retry_after)
    }
}

/// A sparse cube texture under residency management
pub struct ManagedTiledResource {
    id: ResourceId,
    name: String,
    geometry: TilingGeometry,
    source: Arc<dyn TileSource>,
    shadow: ResidencyShadow,
    packed: [PackedState; CUBE_FACE_COUNT],
    packed_slots: Range<u32>,
    registration: u64,
}

impl ManagedTiledResource {
    pub(crate) fn new(
        id: ResourceId,
        name: String,
        geometry: TilingGeometry,
        source: Arc<dyn TileSource>,
        packed_slots: Range<u32>,
        registration: u64,
    ) -> Self {
        let (width, height) = geometry.residency_size();
        let shadow = ResidencyShadow::new(width, height, geometry.packed_mip_cutoff);
        let initial = if geometry.tiles_for_packed_mips == 0 {
            PackedState::Resident
        } else {
            PackedState::Idle { failures: 0, retry_after: 0 }
        };

        Self {
            id,
            name,
            geometry,
            source,
            shadow,
            packed: [initial; CUBE_FACE_COUNT],
            packed_slots,
            registration,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &TilingGeometry {
        &self.geometry
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        &self.source
    }

    pub fn shadow(&self) -> &ResidencyShadow {
        &self.shadow
    }

    pub(crate) fn shadow_mut(&mut self) -> &mut ResidencyShadow {
        &mut self.shadow
    }

    /// Packed-mip load state of `face`
    pub fn packed_state(&self, face: CubeFace) -> PackedState {
        self.packed[face.index()]
    }

    pub(crate) fn set_packed_state(&mut self, face: CubeFace, state: PackedState) {
        self.packed[face.index()] = state;
    }

    /// Whether every face's packed mips have been uploaded
    pub fn packed_resident(&self) -> bool {
        self.packed.iter().all(|s| *s == PackedState::Resident)
    }

    /// Reserved pool slots holding the packed mips, face-major
    pub fn packed_slots(&self) -> Range<u32> {
        self.packed_slots.clone()
    }

    pub(crate) fn registration(&self) -> u64 {
        self.registration
    }

    /// Mapping targets of `face`'s packed tiles paired with their pool slots
    pub fn packed_tiles(&self, face: CubeFace) -> impl Iterator<Item = (TileCoordinate, u32)> + '_ {
        let count = self.geometry.tiles_for_packed_mips;
        let subresource = self.geometry.subresource_index(face, self.geometry.packed_mip_cutoff);
        let first_slot = self.packed_slots.start + face.index() as u32 * count;
        (0..count).map(move |i| (TileCoordinate::new(subresource, i, 0), first_slot + i))
    }
}

impl fmt::Debug for ManagedTiledResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTiledResource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("packed", &self.packed)
            .field("packed_slots", &self.packed_slots)
            .finish_non_exhaustive()
    }
}
