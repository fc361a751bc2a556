//! Tile File Layout
//!
//! A tile file holds, for each of the six faces in array order, the tiles of
//! every individually mapped mip followed by the packed-mip tiles. The most
//! detailed mip comes first and each coarser mip stores a quarter as many tiles,
//! never fewer than one. Tiles are `TILE_SIZE_BYTES` each with no header.

use std::path::Path;

use tessera_core::{CubeFace, CUBE_FACE_COUNT};
use tessera_platform::AsyncFileHandle;

use crate::geometry::TilingGeometry;
use crate::tile::TileCoordinate;
use crate::{ResidencyError, ResidencyResult, TILE_SIZE_BYTES};

/// Magic bytes at the start of synthetic tile payloads
pub const SYNTHETIC_TILE_MAGIC: [u8; 4] = *b"TSRA";

/// Placement of every tile in a tile file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileFileLayout {
    /// Tiles stored for each individually mapped mip of one face
    pub mip_tile_counts: Vec<u64>,
    /// Tiles stored for the packed mips of one face
    pub packed_tiles: u64,
    /// Index of the first tile of each mip, per face
    first_tiles: [Vec<u64>; CUBE_FACE_COUNT],
}

impl TileFileLayout {
    /// Tiles stored for each individually mapped mip of one face
    pub fn mip_tile_counts(geometry: &TilingGeometry) -> Vec<u64> {
        let base = geometry.subresources[0].tile_count() as u64;
        let mut counts = Vec::with_capacity(geometry.packed_mip_cutoff as usize);
        let mut count = base;
        for _ in 0..geometry.packed_mip_cutoff {
            counts.push(count);
            count = (count / 4).max(1);
        }
        counts
    }

    /// Layout of the file that would be written for `geometry`
    pub fn for_geometry(geometry: &TilingGeometry) -> Self {
        Self::build(
            Self::mip_tile_counts(geometry),
            geometry.tiles_for_packed_mips as u64,
        )
    }

    /// Layout of an existing file holding `file_tiles` tiles.
    ///
    /// The per-face stride comes from the file; whatever follows the
    /// individually mapped mips inside a face is the packed tail.
    pub fn from_file_tiles(geometry: &TilingGeometry, file_tiles: u64) -> ResidencyResult<Self> {
        if file_tiles % CUBE_FACE_COUNT as u64 != 0 {
            return Err(ResidencyError::InvalidTileFile(format!(
                "{} tiles cannot be split across {} faces",
                file_tiles, CUBE_FACE_COUNT
            )));
        }

        let face_tiles = file_tiles / CUBE_FACE_COUNT as u64;
        let counts = Self::mip_tile_counts(geometry);
        let standard: u64 = counts.iter().sum();
        if face_tiles < standard {
            return Err(ResidencyError::InvalidTileFile(format!(
                "face holds {} tiles but mips 0..{} need {}",
                face_tiles, geometry.packed_mip_cutoff, standard
            )));
        }

        let packed_tiles = face_tiles - standard;
        if packed_tiles < geometry.tiles_for_packed_mips as u64 {
            return Err(ResidencyError::InvalidTileFile(format!(
                "face has room for {} packed tiles, geometry needs {}",
                packed_tiles, geometry.tiles_for_packed_mips
            )));
        }

        Ok(Self::build(counts, packed_tiles))
    }

    fn build(mip_tile_counts: Vec<u64>, packed_tiles: u64) -> Self {
        let face_tiles: u64 = mip_tile_counts.iter().sum::<u64>() + packed_tiles;
        let first_tiles = std::array::from_fn(|face| {
            let mut next = face as u64 * face_tiles;
            let mut firsts = Vec::with_capacity(mip_tile_counts.len() + 1);
            for count in &mip_tile_counts {
                firsts.push(next);
                next += count;
            }
            // packed tail
            firsts.push(next);
            firsts
        });

        Self {
            mip_tile_counts,
            packed_tiles,
            first_tiles,
        }
    }

    /// Tiles stored per face
    pub fn face_tiles(&self) -> u64 {
        self.mip_tile_counts.iter().sum::<u64>() + self.packed_tiles
    }

    /// Tiles in the whole file
    pub fn total_tiles(&self) -> u64 {
        self.face_tiles() * CUBE_FACE_COUNT as u64
    }

    /// File size in bytes
    pub fn file_size(&self) -> u64 {
        self.total_tiles() * TILE_SIZE_BYTES as u64
    }

    /// Index of the first tile of `mip` on `face`; `mip == packed_mip_cutoff`
    /// addresses the packed tail
    pub fn first_tile(&self, face: CubeFace, mip: u32) -> Option<u64> {
        self.first_tiles[face.index()].get(mip as usize).copied()
    }

    /// Index of the first packed tile of `face`
    pub fn packed_first_tile(&self, face: CubeFace) -> u64 {
        let firsts = &self.first_tiles[face.index()];
        firsts[firsts.len() - 1]
    }
}

/// Deterministic payload for a tile, stamped with its coordinate.
///
/// Used by the `pack` tool and the in-memory source so reads can be verified.
pub fn synthetic_tile_payload(coordinate: TileCoordinate) -> Vec<u8> {
    let mut data = vec![0u8; TILE_SIZE_BYTES];
    let fill = (coordinate.subresource.wrapping_mul(31))
        .wrapping_add(coordinate.x.wrapping_mul(7))
        .wrapping_add(coordinate.y.wrapping_mul(13)) as u8;
    data[16..].fill(fill);
    data[0..4].copy_from_slice(&SYNTHETIC_TILE_MAGIC);
    data[4..8].copy_from_slice(&coordinate.subresource.to_le_bytes());
    data[8..12].copy_from_slice(&coordinate.x.to_le_bytes());
    data[12..16].copy_from_slice(&coordinate.y.to_le_bytes());
    data
}

/// Read the coordinate stamped into a synthetic payload
pub fn synthetic_tile_coordinate(data: &[u8]) -> Option<TileCoordinate> {
    if data.len() < 16 || data[0..4] != SYNTHETIC_TILE_MAGIC {
        return None;
    }
    let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    Some(TileCoordinate::new(word(4), word(8), word(12)))
}

/// Coordinates in file order for one face; packed tiles use the first packed
/// subresource with `x` counting tiles
pub fn face_tile_coordinates(
    geometry: &TilingGeometry,
    layout: &TileFileLayout,
    face: CubeFace,
) -> Vec<TileCoordinate> {
    let mut coordinates = Vec::with_capacity(layout.face_tiles() as usize);
    for (mip, &count) in layout.mip_tile_counts.iter().enumerate() {
        let mip = mip as u32;
        let subresource = geometry.subresource_index(face, mip);
        let width = geometry.subresources[subresource as usize].width_in_tiles.max(1) as u64;
        for i in 0..count {
            coordinates.push(TileCoordinate::new(subresource, (i % width) as u32, (i / width) as u32));
        }
    }

    let packed_subresource = geometry.subresource_index(face, geometry.packed_mip_cutoff);
    for i in 0..layout.packed_tiles {
        coordinates.push(TileCoordinate::new(packed_subresource, i as u32, 0));
    }
    coordinates
}

/// Write a tile file for `geometry` whose payloads are synthetic
pub async fn write_synthetic_tile_file(
    path: impl AsRef<Path>,
    geometry: &TilingGeometry,
) -> ResidencyResult<TileFileLayout> {
    let layout = TileFileLayout::for_geometry(geometry);
    let coordinates: Vec<TileCoordinate> = CubeFace::ALL
        .iter()
        .flat_map(|&face| face_tile_coordinates(geometry, &layout, face))
        .collect();

    let handle = AsyncFileHandle::new(path);
    let written = handle
        .write_chunks(coordinates.into_iter().map(synthetic_tile_payload))
        .await?;
    log::info!(
        "Wrote {} tiles ({} bytes) to {}",
        layout.total_tiles(),
        written,
        handle.path().display()
    );
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_tile_counts_shrink_geometrically() {
        let geometry = TilingGeometry::cube(8, 8, 6, 5, 1).unwrap();
        assert_eq!(TileFileLayout::mip_tile_counts(&geometry), vec![64, 16, 4, 1, 1]);
    }

    #[test]
    fn test_layout_offsets() {
        let geometry = TilingGeometry::cube(4, 4, 4, 3, 2).unwrap();
        let layout = TileFileLayout::for_geometry(&geometry);

        // 16 + 4 + 1 standard tiles and 2 packed tiles per face
        assert_eq!(layout.face_tiles(), 23);
        assert_eq!(layout.total_tiles(), 138);
        assert_eq!(layout.file_size(), 138 * 65536);
        assert_eq!(layout.first_tile(CubeFace::PositiveX, 0), Some(0));
        assert_eq!(layout.first_tile(CubeFace::PositiveX, 2), Some(20));
        assert_eq!(layout.first_tile(CubeFace::NegativeX, 1), Some(39));
        assert_eq!(layout.packed_first_tile(CubeFace::NegativeZ), 5 * 23 + 21);
        assert_eq!(layout.first_tile(CubeFace::PositiveX, 4), None);
    }

    #[test]
    fn test_layout_from_file_tiles() {
        let geometry = TilingGeometry::cube(4, 4, 4, 3, 2).unwrap();

        let layout = TileFileLayout::from_file_tiles(&geometry, 138).unwrap();
        assert_eq!(layout, TileFileLayout::for_geometry(&geometry));

        assert!(TileFileLayout::from_file_tiles(&geometry, 137).is_err());
        // 21 standard tiles per face but no packed tail
        assert!(TileFileLayout::from_file_tiles(&geometry, 126).is_err());
        assert!(TileFileLayout::from_file_tiles(&geometry, 60).is_err());
    }

    #[test]
    fn test_synthetic_payload() {
        let coordinate = TileCoordinate::new(7, 3, 2);
        let data = synthetic_tile_payload(coordinate);

        assert_eq!(data.len(), TILE_SIZE_BYTES);
        assert_eq!(synthetic_tile_coordinate(&data), Some(coordinate));
        assert_eq!(synthetic_tile_coordinate(&[0u8; 8]), None);
    }

    #[test]
    fn test_face_tile_coordinates() {
        let geometry = TilingGeometry::cube(2, 2, 3, 2, 1).unwrap();
        let layout = TileFileLayout::for_geometry(&geometry);

        let coords = face_tile_coordinates(&geometry, &layout, CubeFace::PositiveY);
        assert_eq!(
            coords,
            vec![
                TileCoordinate::new(6, 0, 0),
                TileCoordinate::new(6, 1, 0),
                TileCoordinate::new(6, 0, 1),
                TileCoordinate::new(6, 1, 1),
                TileCoordinate::new(7, 0, 0),
                TileCoordinate::new(8, 0, 0),
            ]
        );
    }
}
