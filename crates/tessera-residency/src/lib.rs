//! # Tessera Residency
//!
//! Sparse virtual-texture residency manager. Keeps the currently visible tiles of
//! very large cube textures mapped into a small, fixed-size physical tile pool,
//! streaming the rest from disk on demand.
//!
//! ## Pipeline
//! - [`sampling`]: low-resolution feedback pass, double-buffered readback
//! - [`decoder`]: feedback pixel to `(u, v, mip, face)`
//! - [`tracker`]: tile lifecycle, load dispatch, mapping and eviction
//! - [`loader`]: ranged reads from packed tile files
//! - [`device`]: the GPU tiled-resource boundary
//!
//! The GPU itself is never touched here; everything that would talk to a real
//! graphics API goes through [`TiledResourceDevice`] and [`FeedbackPass`].

pub mod decoder;
pub mod device;
pub mod geometry;
pub mod loader;
pub mod pool;
pub mod resource;
pub mod sampling;
pub mod shadow;
pub mod source;
pub mod tile;
pub mod tilefile;
pub mod tracker;

pub use decoder::{decode_feedback_pixel, encode_feedback_pixel, DecodedSample};
pub use device::{DeviceCommand, RecordingDevice, TileMappingBatch, TileRangeFlags, TiledResourceDevice};
pub use geometry::{SubresourceTiling, TexelRect, TilingGeometry};
pub use loader::TileLoader;
pub use resource::{ManagedTiledResource, ResourceId};
pub use sampling::{decode_readback, FeedbackCamera, FeedbackPass, FeedbackReadback, FeedbackTarget, SamplingRenderer, SoftwareFeedbackPass};
pub use shadow::ResidencyShadow;
pub use source::{MemoryTileSource, TileFuture, TileSource};
pub use tile::{TileCoordinate, TileHandle, TileKey, TileState, TrackedTile};
pub use tilefile::TileFileLayout;
pub use tracker::{FrameStats, TileTracker};

use tessera_core::ConfigError;
use tessera_platform::PlatformError;
use thiserror::Error;

/// Size of one tile in bytes, in memory and on disk
pub const TILE_SIZE_BYTES: usize = 64 * 1024;

/// Residency manager errors
#[derive(Error, Debug)]
pub enum ResidencyError {
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid tiling geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid tile file: {0}")]
    InvalidTileFile(String),

    #[error("Tile {0} is outside the resource")]
    TileOutOfRange(TileCoordinate),

    #[error("Resource not found: {0}")]
    UnknownResource(ResourceId),

    #[error("Resource already registered: {0}")]
    DuplicateResource(ResourceId),

    #[error("Reserved pool region exhausted: needed {needed} tiles, {available} available")]
    ReservedExhausted { needed: u32, available: u32 },

    #[error("Tile load failed: {0}")]
    LoadFailed(String),

    #[error("Tile payload has {actual} bytes, expected {expected}")]
    InvalidTileSize { expected: usize, actual: usize },

    #[error("Invalid feedback readback: {0}")]
    InvalidReadback(String),

    #[error("Device error: {0}")]
    Device(String),
}

/// Result type for residency operations
pub type ResidencyResult<T> = Result<T, ResidencyError>;
