//! Sample Decoder
//!
//! Feedback pixels are little-endian RGBA8. `RGB` hold a direction quantized from
//! `[-1, 1]` to `[0, 255]`, `A` holds the wanted level of detail times 16. The
//! all-zero pixel means "nothing rendered here".

use tessera_core::math::{to_cube_space, Vec2, Vec3};
use tessera_core::CubeFace;

/// Coarsest mip a sample may request
pub const MAX_SAMPLED_MIP: u32 = 14;

/// Scale between level of detail and the alpha channel
pub const LOD_SCALE: f32 = 16.0;

/// One decoded feedback sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    /// Face-relative horizontal coordinate in `[0, 1]`
    pub u: f32,
    /// Face-relative vertical coordinate in `[0, 1]`
    pub v: f32,
    /// Requested mip level
    pub mip: u32,
    /// Cube face
    pub face: CubeFace,
}

impl DecodedSample {
    /// Face coordinate as a vector
    pub fn uv(&self) -> Vec2 {
        Vec2::new(self.u, self.v)
    }
}

#[inline]
fn dequantize(channel: u32) -> f32 {
    channel as f32 * (2.0 / 255.0) - 1.0
}

#[inline]
fn quantize(value: f32) -> u32 {
    ((value.clamp(-1.0, 1.0) + 1.0) * 0.5 * 255.0).round() as u32
}

/// Decode one feedback pixel; `None` for the empty-pixel sentinel
pub fn decode_feedback_pixel(pixel: u32) -> Option<DecodedSample> {
    if pixel == 0 {
        return None;
    }

    let direction = Vec3::new(
        dequantize(pixel & 0xff),
        dequantize((pixel >> 8) & 0xff),
        dequantize((pixel >> 16) & 0xff),
    );
    let lod = (pixel >> 24) as f32 / LOD_SCALE;

    let (face, uv) = CubeFace::project(direction)?;
    let mip = (lod.round() as u32).min(MAX_SAMPLED_MIP);

    Some(DecodedSample {
        u: uv.x,
        v: uv.y,
        mip,
        face,
    })
}

/// Encode a direction and level of detail the way the feedback shader does.
///
/// The direction is rescaled so its major axis is exactly ±1 before quantizing,
/// which keeps the decoded face and coordinate within one quantization step. The
/// single direction `(-1, -1, -1)` at lod 0 collides with the empty sentinel.
pub fn encode_feedback_pixel(direction: Vec3, lod: f32) -> u32 {
    let direction = to_cube_space(direction);
    let alpha = (lod * LOD_SCALE).round().clamp(0.0, 255.0) as u32;

    quantize(direction.x) | (quantize(direction.y) << 8) | (quantize(direction.z) << 16) | (alpha << 24)
}

/// Encode a face coordinate and level of detail
pub fn encode_face_sample(face: CubeFace, uv: Vec2, lod: f32) -> u32 {
    encode_feedback_pixel(face.direction(uv), lod)
}
