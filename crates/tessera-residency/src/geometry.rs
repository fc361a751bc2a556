//! Tiling Geometry
//!
//! Layout of a sparse cube texture in tiles, as reported by the GPU. Subresources
//! are numbered face-major: `face * mip_levels + mip`. Mips at or beyond
//! `packed_mip_cutoff` are packed together and can only be mapped as a unit.

use tessera_core::math::{div_ceil, Vec2};
use tessera_core::{CubeFace, CUBE_FACE_COUNT};

use crate::tile::TileCoordinate;
use crate::{ResidencyError, ResidencyResult};

/// Size of one subresource in tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
}

impl SubresourceTiling {
    /// Number of tiles in the subresource
    pub fn tile_count(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles
    }
}

/// Half-open rectangle of residency texels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TexelRect {
    /// Whether the rectangle covers no texels
    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }
}

/// Tiling of one sparse cube texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingGeometry {
    /// Mip levels per face
    pub mip_levels: u32,
    /// First packed mip; equals the number of individually mapped mips
    pub packed_mip_cutoff: u32,
    /// Tiles holding the packed mips of one face
    pub tiles_for_packed_mips: u32,
    /// Per-subresource size, indexed by subresource
    pub subresources: Vec<SubresourceTiling>,
    /// Tiles in the whole resource
    pub total_tile_count: u32,
}

impl TilingGeometry {
    /// Describe a cube texture whose mip 0 is `width x height` tiles per face.
    ///
    /// Each coarser mip halves the tile grid, rounding up.
    pub fn cube(
        width_in_tiles: u32,
        height_in_tiles: u32,
        mip_levels: u32,
        packed_mip_cutoff: u32,
        tiles_for_packed_mips: u32,
    ) -> ResidencyResult<Self> {
        if width_in_tiles == 0 || height_in_tiles == 0 {
            return Err(ResidencyError::InvalidGeometry("mip 0 has no tiles".into()));
        }
        if mip_levels == 0 || mip_levels > 16 {
            return Err(ResidencyError::InvalidGeometry(format!(
                "mip_levels must be in 1..=16, got {}",
                mip_levels
            )));
        }
        if packed_mip_cutoff > mip_levels {
            return Err(ResidencyError::InvalidGeometry(format!(
                "packed_mip_cutoff {} exceeds mip_levels {}",
                packed_mip_cutoff, mip_levels
            )));
        }
        if packed_mip_cutoff < mip_levels && tiles_for_packed_mips == 0 {
            return Err(ResidencyError::InvalidGeometry(
                "packed mips present but occupy no tiles".into(),
            ));
        }

        let per_face: Vec<SubresourceTiling> = (0..mip_levels)
            .map(|mip| SubresourceTiling {
                width_in_tiles: div_ceil(width_in_tiles, 1 << mip),
                height_in_tiles: div_ceil(height_in_tiles, 1 << mip),
            })
            .collect();

        let standard_tiles: u32 = per_face[..packed_mip_cutoff as usize]
            .iter()
            .map(SubresourceTiling::tile_count)
            .sum();
        let packed_tiles = if packed_mip_cutoff < mip_levels { tiles_for_packed_mips } else { 0 };

        let mut subresources = Vec::with_capacity(per_face.len() * CUBE_FACE_COUNT);
        for _ in 0..CUBE_FACE_COUNT {
            subresources.extend_from_slice(&per_face);
        }

        Ok(Self {
            mip_levels,
            packed_mip_cutoff,
            tiles_for_packed_mips: packed_tiles,
            subresources,
            total_tile_count: (standard_tiles + packed_tiles) * CUBE_FACE_COUNT as u32,
        })
    }

    /// Check a geometry reported from outside the crate.
    ///
    /// Accepts exactly what [`TilingGeometry::cube`] could have produced in
    /// shape: a bounded mip count, one tiling per subresource and no empty
    /// subresource.
    pub fn validate(&self) -> ResidencyResult<()> {
        if self.mip_levels == 0 || self.mip_levels > 16 {
            return Err(ResidencyError::InvalidGeometry(format!(
                "mip_levels must be in 1..=16, got {}",
                self.mip_levels
            )));
        }
        if self.packed_mip_cutoff > self.mip_levels {
            return Err(ResidencyError::InvalidGeometry(format!(
                "packed_mip_cutoff {} exceeds mip_levels {}",
                self.packed_mip_cutoff, self.mip_levels
            )));
        }
        if self.packed_mip_cutoff < self.mip_levels && self.tiles_for_packed_mips == 0 {
            return Err(ResidencyError::InvalidGeometry(
                "packed mips present but occupy no tiles".into(),
            ));
        }
        let expected = self.mip_levels as usize * CUBE_FACE_COUNT;
        if self.subresources.len() != expected {
            return Err(ResidencyError::InvalidGeometry(format!(
                "expected {} subresources, got {}",
                expected,
                self.subresources.len()
            )));
        }
        if let Some(index) = self
            .subresources
            .iter()
            .position(|t| t.width_in_tiles == 0 || t.height_in_tiles == 0)
        {
            return Err(ResidencyError::InvalidGeometry(format!(
                "subresource {} has no tiles",
                index
            )));
        }
        Ok(())
    }

    /// Subresource index of `(face, mip)`
    pub fn subresource_index(&self, face: CubeFace, mip: u32) -> u32 {
        face.index() as u32 * self.mip_levels + mip
    }

    /// Face and mip of a subresource index
    pub fn face_and_mip(&self, subresource: u32) -> Option<(CubeFace, u32)> {
        let face = CubeFace::from_index((subresource / self.mip_levels) as usize)?;
        Some((face, subresource % self.mip_levels))
    }

    /// Tiling of `(face, mip)`
    pub fn subresource(&self, face: CubeFace, mip: u32) -> Option<&SubresourceTiling> {
        if mip >= self.mip_levels {
            return None;
        }
        self.subresources.get(self.subresource_index(face, mip) as usize)
    }

    /// Whether `mip` lives in the packed tail
    pub fn is_packed(&self, mip: u32) -> bool {
        mip >= self.packed_mip_cutoff
    }

    /// Size of the per-face residency map: one texel per mip-0 tile
    pub fn residency_size(&self) -> (u32, u32) {
        let base = self.subresources[0];
        (base.width_in_tiles, base.height_in_tiles)
    }

    /// Tile of `(face, mip)` containing the face coordinate `uv`
    pub fn tile_for_uv(&self, face: CubeFace, mip: u32, uv: Vec2) -> Option<TileCoordinate> {
        let tiling = self.subresource(face, mip)?;
        let x = ((uv.x.clamp(0.0, 1.0) * tiling.width_in_tiles as f32) as u32)
            .min(tiling.width_in_tiles - 1);
        let y = ((uv.y.clamp(0.0, 1.0) * tiling.height_in_tiles as f32) as u32)
            .min(tiling.height_in_tiles - 1);
        Some(TileCoordinate::new(self.subresource_index(face, mip), x, y))
    }

    /// Whether a coordinate addresses an individually mapped tile
    pub fn contains(&self, coordinate: TileCoordinate) -> bool {
        match self.face_and_mip(coordinate.subresource) {
            Some((face, mip)) if !self.is_packed(mip) => self
                .subresource(face, mip)
                .is_some_and(|t| coordinate.x < t.width_in_tiles && coordinate.y < t.height_in_tiles),
            _ => false,
        }
    }

    /// Residency texels covered by tile `(x, y)` of `mip`
    pub fn footprint(&self, mip: u32, x: u32, y: u32) -> TexelRect {
        let (width, height) = self.residency_size();
        let shift = mip.min(31);
        TexelRect {
            x0: (x << shift).min(width),
            y0: (y << shift).min(height),
            x1: ((x + 1) << shift).min(width),
            y1: ((y + 1) << shift).min(height),
        }
    }
}
