//! Math utilities
//!
//! Re-exports from glam and the cube-map projection helpers shared by the
//! feedback encoder and decoder.

pub use glam::{Quat, UVec2, Vec2, Vec3};

use serde::{Deserialize, Serialize};

/// Number of faces in a cube map
pub const CUBE_FACE_COUNT: usize = 6;

/// Cube map face, numbered in the standard `+X, -X, +Y, -Y, +Z, -Z` array order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CubeFace {
    PositiveX = 0,
    NegativeX = 1,
    PositiveY = 2,
    NegativeY = 3,
    PositiveZ = 4,
    NegativeZ = 5,
}

impl CubeFace {
    /// All faces in array-slice order
    pub const ALL: [CubeFace; CUBE_FACE_COUNT] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    /// Get the face for an array-slice index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Get the array-slice index of this face
    pub fn index(self) -> usize {
        self as usize
    }

    /// Select the face hit by `direction` and project onto it.
    ///
    /// Returns the face and its `(u, v)` coordinate in `[0, 1]²`, or `None` for a
    /// zero-length direction. Ties on the dominant axis resolve X, then Y, then Z.
    pub fn project(direction: Vec3) -> Option<(CubeFace, Vec2)> {
        let abs = direction.abs();

        let (face, sc, tc, ma) = if abs.x >= abs.y && abs.x >= abs.z {
            if direction.x >= 0.0 {
                (CubeFace::PositiveX, -direction.z, -direction.y, abs.x)
            } else {
                (CubeFace::NegativeX, direction.z, -direction.y, abs.x)
            }
        } else if abs.y >= abs.z {
            if direction.y >= 0.0 {
                (CubeFace::PositiveY, direction.x, direction.z, abs.y)
            } else {
                (CubeFace::NegativeY, direction.x, -direction.z, abs.y)
            }
        } else if direction.z >= 0.0 {
            (CubeFace::PositiveZ, direction.x, -direction.y, abs.z)
        } else {
            (CubeFace::NegativeZ, -direction.x, -direction.y, abs.z)
        };

        if ma <= 0.0 {
            return None;
        }

        let u = (0.5 * (sc / ma + 1.0)).clamp(0.0, 1.0);
        let v = (0.5 * (tc / ma + 1.0)).clamp(0.0, 1.0);
        Some((face, Vec2::new(u, v)))
    }

    /// Inverse of [`CubeFace::project`].
    ///
    /// The returned vector is not normalized: its major component is exactly ±1.
    pub fn direction(self, uv: Vec2) -> Vec3 {
        let s = uv.x * 2.0 - 1.0;
        let t = uv.y * 2.0 - 1.0;

        match self {
            CubeFace::PositiveX => Vec3::new(1.0, -t, -s),
            CubeFace::NegativeX => Vec3::new(-1.0, -t, s),
            CubeFace::PositiveY => Vec3::new(s, 1.0, t),
            CubeFace::NegativeY => Vec3::new(s, -1.0, -t),
            CubeFace::PositiveZ => Vec3::new(s, -t, 1.0),
            CubeFace::NegativeZ => Vec3::new(-s, -t, -1.0),
        }
    }
}

impl std::fmt::Display for CubeFace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CubeFace::PositiveX => "+X",
            CubeFace::NegativeX => "-X",
            CubeFace::PositiveY => "+Y",
            CubeFace::NegativeY => "-Y",
            CubeFace::PositiveZ => "+Z",
            CubeFace::NegativeZ => "-Z",
        };
        f.write_str(name)
    }
}

/// Scale a direction so its largest component has magnitude 1
pub fn to_cube_space(direction: Vec3) -> Vec3 {
    let major = direction.abs().max_element();
    if major > 0.0 {
        direction / major
    } else {
        direction
    }
}

/// Integer division rounding up
pub fn div_ceil(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor.max(1))
}
