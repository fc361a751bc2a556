//! # Tessera Core
//!
//! Shared foundation for the Tessera virtual-texture residency manager.
//!
//! - **Config**: residency and sampling tunables, loadable from JSON
//! - **Math**: cube-face selection and projection used by the feedback encoding
//! - **Frames**: the frame counter the tracker stamps tiles with

pub mod config;
pub mod math;

pub use config::{ConfigError, ConfigResult, ResidencyConfig, RetryPolicy, SamplingConfig, TesseraConfig};
pub use math::{CubeFace, CUBE_FACE_COUNT};

/// Monotonic frame number, starting at 1 for the first update
pub type FrameNumber = u64;

/// Frame counter owned by whoever drives the per-frame update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounter {
    current: FrameNumber,
}

impl FrameCounter {
    /// Create a counter that has not started any frame yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next frame and return its number
    pub fn advance(&mut self) -> FrameNumber {
        self.current += 1;
        self.current
    }

    /// Number of the most recently started frame (0 before the first)
    pub fn current(&self) -> FrameNumber {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counter() {
        let mut counter = FrameCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.advance(), 1);
        assert_eq!(counter.advance(), 2);
        assert_eq!(counter.current(), 2);
    }
}
