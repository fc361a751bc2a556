//! Tile Sources
//!
//! Where tile bytes come from. The tracker only needs a future per tile; the
//! packed tile file reader ([`crate::TileLoader`]) is the production source and
//! [`MemoryTileSource`] serves synthetic payloads for tools and tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;
use tessera_core::CubeFace;
use tokio::sync::Semaphore;

use crate::geometry::TilingGeometry;
use crate::tile::TileCoordinate;
use crate::tilefile::synthetic_tile_payload;
use crate::{ResidencyError, ResidencyResult};

/// Boxed future resolving to a tile payload
pub type TileFuture = Pin<Box<dyn Future<Output = ResidencyResult<Vec<u8>>> + Send + 'static>>;

/// Asynchronous provider of tile payloads for one resource
pub trait TileSource: Send + Sync + 'static {
    /// Fetch one individually mapped tile
    fn load_tile_async(&self, coordinate: TileCoordinate) -> TileFuture;

    /// Fetch every packed-mip tile of `face`, concatenated in file order
    fn load_packed_async(&self, face: CubeFace) -> TileFuture;
}

/// In-memory source producing synthetic payloads.
///
/// Individual coordinates can be made to fail or to wait on a gate, which lets
/// callers hold loads in flight for as long as they need.
pub struct MemoryTileSource {
    geometry: TilingGeometry,
    failing: Mutex<AHashSet<TileCoordinate>>,
    gated: Mutex<AHashSet<TileCoordinate>>,
    gate: Arc<Semaphore>,
    requests: AtomicUsize,
}

impl MemoryTileSource {
    /// Create a source serving tiles of `geometry`
    pub fn new(geometry: TilingGeometry) -> Self {
        Self {
            geometry,
            failing: Mutex::new(AHashSet::new()),
            gated: Mutex::new(AHashSet::new()),
            gate: Arc::new(Semaphore::new(0)),
            requests: AtomicUsize::new(0),
        }
    }

    /// Make loads of `coordinate` fail until [`MemoryTileSource::clear_failure`]
    pub fn fail(&self, coordinate: TileCoordinate) {
        self.failing.lock().insert(coordinate);
    }

    /// Let loads of `coordinate` succeed again
    pub fn clear_failure(&self, coordinate: TileCoordinate) {
        self.failing.lock().remove(&coordinate);
    }

    /// Hold loads of `coordinate` until [`MemoryTileSource::open_gate`]
    pub fn hold(&self, coordinate: TileCoordinate) {
        self.gated.lock().insert(coordinate);
    }

    /// Hold every load issued from now on
    pub fn hold_all(&self) {
        let mut gated = self.gated.lock();
        for (subresource, tiling) in self.geometry.subresources.iter().enumerate() {
            for y in 0..tiling.height_in_tiles {
                for x in 0..tiling.width_in_tiles {
                    gated.insert(TileCoordinate::new(subresource as u32, x, y));
                }
            }
        }
    }

    /// Release every held load, including ones issued later
    pub fn open_gate(&self) {
        self.gated.lock().clear();
        // waiters take the permit in turn and hand it back when they finish
        self.gate.add_permits(1);
    }

    /// Number of tile loads requested so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

impl TileSource for MemoryTileSource {
    fn load_tile_async(&self, coordinate: TileCoordinate) -> TileFuture {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let in_range = self.geometry.contains(coordinate);
        let fails = self.failing.lock().contains(&coordinate);
        let gate = self.gated.lock().contains(&coordinate).then(|| Arc::clone(&self.gate));

        Box::pin(async move {
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| ResidencyError::LoadFailed(e.to_string()))?;
            }
            if !in_range {
                return Err(ResidencyError::TileOutOfRange(coordinate));
            }
            if fails {
                return Err(ResidencyError::LoadFailed(format!("injected failure at {}", coordinate)));
            }
            Ok(synthetic_tile_payload(coordinate))
        })
    }

    fn load_packed_async(&self, face: CubeFace) -> TileFuture {
        let subresource = self.geometry.subresource_index(face, self.geometry.packed_mip_cutoff);
        let count = self.geometry.tiles_for_packed_mips;

        Box::pin(async move {
            let mut data = Vec::with_capacity(count as usize * crate::TILE_SIZE_BYTES);
            for i in 0..count {
                data.extend_from_slice(&synthetic_tile_payload(TileCoordinate::new(subresource, i, 0)));
            }
            Ok(data)
        })
    }
}
