//! Tiles
//!
//! Addressing and lifecycle of tracked tiles.
//!
//! A tile is created the first time feedback asks for it and then moves through
//! `Seen -> Loading -> Loaded -> Mapped` until it is evicted. A tile that goes
//! stale before it reaches the pool is discarded instead.

use std::cmp::Ordering;

use slotmap::new_key_type;
use tessera_core::{CubeFace, FrameNumber};

use crate::resource::ResourceId;

new_key_type! {
    /// Stable handle to a tile in the tracker's arena
    pub struct TileHandle;
}

/// Logical address of one tile within a resource's face/mip chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoordinate {
    /// Subresource index, `face * mip_levels + mip`
    pub subresource: u32,
    /// Column in tiles
    pub x: u32,
    /// Row in tiles
    pub y: u32,
}

impl TileCoordinate {
    /// Create a tile coordinate
    pub fn new(subresource: u32, x: u32, y: u32) -> Self {
        Self { subresource, x, y }
    }
}

impl std::fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(sub {}, {}, {})", self.subresource, self.x, self.y)
    }
}

/// Unique, totally ordered key of a tracked tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileKey {
    /// Owning resource
    pub resource: ResourceId,
    /// Tile within the resource
    pub coordinate: TileCoordinate,
}

impl TileKey {
    /// Create a tile key
    pub fn new(resource: ResourceId, coordinate: TileCoordinate) -> Self {
        Self { resource, coordinate }
    }
}

/// Lifecycle state of a tracked tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// Requested by feedback, waiting for a load slot
    Seen,
    /// Load in flight
    Loading,
    /// Bytes in memory, waiting for a pool slot
    Loaded,
    /// Occupies one physical pool slot
    Mapped,
}

/// A tile owned by the tracker
#[derive(Debug, Clone)]
pub struct TrackedTile {
    /// Key of this tile
    pub key: TileKey,
    /// Mip level, 0 is most detailed
    pub mip: u32,
    /// Cube face
    pub face: CubeFace,
    /// Last frame feedback asked for this tile
    pub last_seen: FrameNumber,
    /// Lifecycle state
    pub state: TileState,
    /// Pool slot while mapped
    pub physical_offset: Option<u32>,
    /// Loaded payload, held until it is uploaded
    pub data: Option<Vec<u8>>,
    /// Consecutive failed loads
    pub failed_loads: u32,
    /// Earliest frame the next load may be dispatched
    pub retry_after: FrameNumber,
}

impl TrackedTile {
    /// Create a freshly sighted tile
    pub fn new(key: TileKey, mip: u32, face: CubeFace, frame: FrameNumber) -> Self {
        Self {
            key,
            mip,
            face,
            last_seen: frame,
            state: TileState::Seen,
            physical_offset: None,
            data: None,
            failed_loads: 0,
            retry_after: 0,
        }
    }

    /// Record a sighting; `last_seen` never moves backwards
    pub fn touch(&mut self, frame: FrameNumber) {
        self.last_seen = self.last_seen.max(frame);
    }

    /// Whether a load may be dispatched in `frame`
    pub fn ready_for_load(&self, frame: FrameNumber) -> bool {
        self.state == TileState::Seen && frame >= self.retry_after
    }

    /// Whether the tile currently holds a pool slot
    pub fn is_resident(&self) -> bool {
        self.state == TileState::Mapped
    }
}

/// Order for the seen and loading queues: most recently seen first, then most
/// detailed first
pub fn load_order(a: &TrackedTile, b: &TrackedTile) -> Ordering {
    b.last_seen
        .cmp(&a.last_seen)
        .then(a.mip.cmp(&b.mip))
        .then(a.key.cmp(&b.key))
}

/// Order for the mapped queue: the head is the next eviction candidate, i.e. the
/// least recently seen, most detailed tile
pub fn eviction_order(a: &TrackedTile, b: &TrackedTile) -> Ordering {
    a.last_seen
        .cmp(&b.last_seen)
        .then(a.mip.cmp(&b.mip))
        .then(a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(x: u32, mip: u32, last_seen: FrameNumber) -> TrackedTile {
        let key = TileKey::new(ResourceId(0), TileCoordinate::new(mip, x, 0));
        TrackedTile::new(key, mip, CubeFace::PositiveX, last_seen)
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut t = tile(0, 0, 5);
        t.touch(3);
        assert_eq!(t.last_seen, 5);
        t.touch(9);
        assert_eq!(t.last_seen, 9);
    }

    #[test]
    fn test_load_order_prefers_recent_then_detailed() {
        let mut tiles = [tile(0, 2, 4), tile(1, 0, 4), tile(2, 0, 7), tile(3, 1, 1)];
        tiles.sort_by(load_order);

        let order: Vec<_> = tiles.iter().map(|t| (t.last_seen, t.mip)).collect();
        assert_eq!(order, vec![(7, 0), (4, 0), (4, 2), (1, 1)]);
    }

    #[test]
    fn test_eviction_order_prefers_old_then_detailed() {
        let mut tiles = [tile(0, 2, 4), tile(1, 0, 4), tile(2, 0, 7), tile(3, 1, 1)];
        tiles.sort_by(eviction_order);

        let order: Vec<_> = tiles.iter().map(|t| (t.last_seen, t.mip)).collect();
        assert_eq!(order, vec![(1, 1), (4, 0), (4, 2), (7, 0)]);
    }

    #[test]
    fn test_ready_for_load_respects_backoff() {
        let mut t = tile(0, 0, 1);
        assert!(t.ready_for_load(1));
        t.retry_after = 10;
        assert!(!t.ready_for_load(9));
        assert!(t.ready_for_load(10));
        t.state = TileState::Loading;
        assert!(!t.ready_for_load(20));
    }
}
