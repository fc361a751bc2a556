//! Residency Shadow
//!
//! CPU copy of the per-face residency map shaders use to clamp sampling to
//! resident detail. Each texel covers one mip-0 tile and holds
//! `16 * coarsest guaranteed-resident mip`; the scale leaves room for the shader
//! to interpolate between mip steps.

use tessera_core::{CubeFace, CUBE_FACE_COUNT};

use crate::geometry::TexelRect;

/// Scale between a mip level and its stored shadow value
pub const SHADOW_MIP_SCALE: u32 = 16;

/// Per-face residency map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidencyShadow {
    width: u32,
    height: u32,
    faces: [Vec<u8>; CUBE_FACE_COUNT],
    dirty: bool,
}

impl ResidencyShadow {
    /// Create a shadow where every texel reports `resident_mip`
    pub fn new(width: u32, height: u32, resident_mip: u32) -> Self {
        let value = Self::encode(resident_mip);
        Self {
            width,
            height,
            faces: std::array::from_fn(|_| vec![value; (width * height) as usize]),
            dirty: true,
        }
    }

    fn encode(mip: u32) -> u8 {
        (mip.saturating_mul(SHADOW_MIP_SCALE)).min(u8::MAX as u32) as u8
    }

    /// Width in texels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in texels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Stored value at a texel
    pub fn value(&self, face: CubeFace, x: u32, y: u32) -> u8 {
        self.faces[face.index()][(y * self.width + x) as usize]
    }

    /// Raw bytes of every face, row-major
    pub fn faces(&self) -> &[Vec<u8>; CUBE_FACE_COUNT] {
        &self.faces
    }

    /// A tile of `mip` covering `rect` became resident
    pub fn on_mapped(&mut self, face: CubeFace, rect: TexelRect, mip: u32) {
        let value = Self::encode(mip);
        self.apply(face, rect, |texel| (*texel).min(value));
    }

    /// A tile of `mip` covering `rect` was evicted
    pub fn on_evicted(&mut self, face: CubeFace, rect: TexelRect, mip: u32) {
        let value = Self::encode(mip + 1);
        self.apply(face, rect, |texel| (*texel).max(value));
    }

    fn apply(&mut self, face: CubeFace, rect: TexelRect, f: impl Fn(&u8) -> u8) {
        let width = self.width;
        let x1 = rect.x1.min(self.width);
        let y1 = rect.y1.min(self.height);
        if rect.x0 >= x1 || rect.y0 >= y1 {
            return;
        }
        let texels = &mut self.faces[face.index()];

        for y in rect.y0..y1 {
            let row = (y * width) as usize;
            for texel in &mut texels[row + rect.x0 as usize..row + x1 as usize] {
                let updated = f(texel);
                if updated != *texel {
                    *texel = updated;
                    self.dirty = true;
                }
            }
        }
    }

    /// Whether the shadow changed since the last upload
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, returning its previous value
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}
