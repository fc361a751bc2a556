//! Tile Loader
//!
//! Reads tiles of one managed resource from its packed tile file. The file is
//! opened once; every load is an independent positional read of exactly one
//! tile, so any number of loads may be in flight against the same handle.

use std::path::Path;

use tessera_core::CubeFace;
use tessera_platform::RandomAccessFile;

use crate::geometry::TilingGeometry;
use crate::source::{TileFuture, TileSource};
use crate::tile::TileCoordinate;
use crate::tilefile::TileFileLayout;
use crate::{ResidencyError, ResidencyResult, TILE_SIZE_BYTES};

/// Ranged reader over a packed tile file
#[derive(Debug, Clone)]
pub struct TileLoader {
    file: RandomAccessFile,
    geometry: TilingGeometry,
    layout: TileFileLayout,
}

impl TileLoader {
    /// Open `path` and index it against `geometry`
    pub async fn open(path: impl AsRef<Path>, geometry: &TilingGeometry) -> ResidencyResult<Self> {
        let file = RandomAccessFile::open(path).await?;
        Self::from_file(file, geometry)
    }

    /// Index an already opened file against `geometry`
    pub fn from_file(file: RandomAccessFile, geometry: &TilingGeometry) -> ResidencyResult<Self> {
        if file.len() % TILE_SIZE_BYTES as u64 != 0 {
            return Err(ResidencyError::InvalidTileFile(format!(
                "{} is {} bytes, not a whole number of tiles",
                file.path().display(),
                file.len()
            )));
        }

        let layout = TileFileLayout::from_file_tiles(geometry, file.len() / TILE_SIZE_BYTES as u64)?;
        log::debug!(
            "Indexed {}: {} tiles per face, {} packed",
            file.path().display(),
            layout.face_tiles(),
            layout.packed_tiles
        );

        Ok(Self {
            file,
            geometry: geometry.clone(),
            layout,
        })
    }

    /// Layout of the backing file
    pub fn layout(&self) -> &TileFileLayout {
        &self.layout
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Byte offset of a tile within the file
    pub fn file_offset(&self, coordinate: TileCoordinate) -> ResidencyResult<u64> {
        if !self.geometry.contains(coordinate) {
            return Err(ResidencyError::TileOutOfRange(coordinate));
        }
        let (face, mip) = self
            .geometry
            .face_and_mip(coordinate.subresource)
            .ok_or(ResidencyError::TileOutOfRange(coordinate))?;
        let first = self
            .layout
            .first_tile(face, mip)
            .ok_or(ResidencyError::TileOutOfRange(coordinate))?;

        let width = self.geometry.subresources[coordinate.subresource as usize].width_in_tiles as u64;
        let index = coordinate.y as u64 * width + coordinate.x as u64;
        if index >= self.layout.mip_tile_counts[mip as usize] {
            return Err(ResidencyError::TileOutOfRange(coordinate));
        }

        Ok((first + index) * TILE_SIZE_BYTES as u64)
    }

    /// Byte range holding the packed mips of `face`
    pub fn packed_range(&self, face: CubeFace) -> (u64, usize) {
        let offset = self.layout.packed_first_tile(face) * TILE_SIZE_BYTES as u64;
        let len = self.geometry.tiles_for_packed_mips as usize * TILE_SIZE_BYTES;
        (offset, len)
    }
}

impl TileSource for TileLoader {
    fn load_tile_async(&self, coordinate: TileCoordinate) -> TileFuture {
        let offset = self.file_offset(coordinate);
        let file = self.file.clone();

        Box::pin(async move {
            let offset = offset?;
            Ok(file.read_at(offset, TILE_SIZE_BYTES).await?)
        })
    }

    fn load_packed_async(&self, face: CubeFace) -> TileFuture {
        let (offset, len) = self.packed_range(face);
        let file = self.file.clone();

        Box::pin(async move { Ok(file.read_at(offset, len).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tilefile::{synthetic_tile_coordinate, write_synthetic_tile_file};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_loads_the_addressed_tile() {
        let geometry = TilingGeometry::cube(4, 4, 4, 3, 1).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("addressed.tiles");
        write_synthetic_tile_file(&path, &geometry).await.unwrap();

        let loader = TileLoader::open(&path, &geometry).await.unwrap();
        for coordinate in [
            TileCoordinate::new(0, 0, 0),
            TileCoordinate::new(0, 3, 2),
            TileCoordinate::new(geometry.subresource_index(CubeFace::NegativeZ, 1), 1, 1),
            TileCoordinate::new(geometry.subresource_index(CubeFace::PositiveY, 2), 0, 0),
        ] {
            let data = loader.load_tile_async(coordinate).await.unwrap();
            assert_eq!(data.len(), TILE_SIZE_BYTES);
            assert_eq!(synthetic_tile_coordinate(&data), Some(coordinate));
        }
    }

    #[tokio::test]
    async fn test_file_offset_formula() {
        let geometry = TilingGeometry::cube(4, 4, 3, 3, 0).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.tiles");
        write_synthetic_tile_file(&path, &geometry).await.unwrap();

        let loader = TileLoader::open(&path, &geometry).await.unwrap();
        // face 1, mip 1: 21 tiles per face, 16 before mip 1, row 1 of width 2
        let coordinate = TileCoordinate::new(4, 1, 1);
        let expected = (21 + 16 + 2 + 1) * TILE_SIZE_BYTES as u64;
        assert_eq!(loader.file_offset(coordinate).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_handle() {
        let geometry = TilingGeometry::cube(4, 4, 1, 1, 0).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("concurrent.tiles");
        write_synthetic_tile_file(&path, &geometry).await.unwrap();

        let loader = TileLoader::open(&path, &geometry).await.unwrap();
        let coordinates: Vec<_> = (0..16).map(|i| TileCoordinate::new(2, i % 4, i / 4)).collect();
        let tasks: Vec<_> = coordinates
            .iter()
            .map(|&c| tokio::spawn(loader.load_tile_async(c)))
            .collect();

        for (task, coordinate) in tasks.into_iter().zip(coordinates) {
            let data = task.await.unwrap().unwrap();
            assert_eq!(synthetic_tile_coordinate(&data), Some(coordinate));
        }
    }

    #[tokio::test]
    async fn test_packed_tiles() {
        let geometry = TilingGeometry::cube(4, 4, 5, 2, 2).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("packed.tiles");
        write_synthetic_tile_file(&path, &geometry).await.unwrap();

        let loader = TileLoader::open(&path, &geometry).await.unwrap();
        let data = loader.load_packed_async(CubeFace::PositiveZ).await.unwrap();
        assert_eq!(data.len(), 2 * TILE_SIZE_BYTES);

        let packed = geometry.subresource_index(CubeFace::PositiveZ, 2);
        assert_eq!(synthetic_tile_coordinate(&data), Some(TileCoordinate::new(packed, 0, 0)));
        assert_eq!(
            synthetic_tile_coordinate(&data[TILE_SIZE_BYTES..]),
            Some(TileCoordinate::new(packed, 1, 0))
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let geometry = TilingGeometry::cube(4, 4, 3, 2, 1).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.tiles");
        write_synthetic_tile_file(&path, &geometry).await.unwrap();

        let loader = TileLoader::open(&path, &geometry).await.unwrap();
        assert!(loader.load_tile_async(TileCoordinate::new(0, 4, 0)).await.is_err());
        // packed mip is not individually addressable
        assert!(loader.file_offset(TileCoordinate::new(2, 0, 0)).is_err());
    }

    #[tokio::test]
    async fn test_rejects_truncated_file() {
        let geometry = TilingGeometry::cube(4, 4, 1, 1, 0).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncated.tiles");
        std::fs::write(&path, vec![0u8; TILE_SIZE_BYTES * 6 + 10]).unwrap();

        let result = TileLoader::open(&path, &geometry).await;
        assert!(matches!(result, Err(ResidencyError::InvalidTileFile(_))));
    }
}
