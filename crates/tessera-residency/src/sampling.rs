//! Sampling Renderer
//!
//! Drives the low-resolution feedback pass and turns its readback into decoded
//! samples. Readback is double-buffered: each frame reads the target rendered
//! the frame before, so the GPU never has to be waited on.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use tessera_core::math::{Quat, Vec3};
use tessera_core::SamplingConfig;

use crate::decoder::{decode_feedback_pixel, encode_feedback_pixel, DecodedSample};
use crate::{ResidencyError, ResidencyResult};

/// Bytes per feedback pixel
pub const FEEDBACK_PIXEL_BYTES: usize = 4;

/// Row alignment of staging buffers
pub const READBACK_PITCH_ALIGNMENT: usize = 256;

/// Offscreen target holding one frame's feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedbackTarget {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// CPU copy of a feedback target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackReadback {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows
    pub row_pitch: usize,
}

/// Renderer-side half of feedback sampling
pub trait FeedbackPass {
    /// Render proxy geometry into a new `width x height` feedback target
    fn render_feedback_pass(&mut self, width: u32, height: u32) -> ResidencyResult<FeedbackTarget>;

    /// Copy a finished target into CPU-readable memory
    fn read_back(&mut self, target: &FeedbackTarget) -> ResidencyResult<FeedbackReadback>;
}

/// Decode every non-empty pixel of a readback.
///
/// Identical pixels decode to identical samples, so each distinct value is
/// decoded once.
pub fn decode_readback(readback: &FeedbackReadback) -> ResidencyResult<Vec<DecodedSample>> {
    let row_bytes = readback.width as usize * FEEDBACK_PIXEL_BYTES;
    if readback.row_pitch < row_bytes {
        return Err(ResidencyError::InvalidReadback(format!(
            "row pitch {} is smaller than a {}-pixel row",
            readback.row_pitch, readback.width
        )));
    }
    let needed = match readback.height {
        0 => 0,
        h => readback.row_pitch * (h as usize - 1) + row_bytes,
    };
    if readback.data.len() < needed {
        return Err(ResidencyError::InvalidReadback(format!(
            "{} bytes cannot hold {}x{} pixels at pitch {}",
            readback.data.len(),
            readback.width,
            readback.height,
            readback.row_pitch
        )));
    }

    let mut distinct = AHashSet::new();
    let mut samples = Vec::new();
    for y in 0..readback.height as usize {
        let row = &readback.data[y * readback.row_pitch..y * readback.row_pitch + row_bytes];
        for pixel in row.chunks_exact(FEEDBACK_PIXEL_BYTES) {
            let value = u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]]);
            if value == 0 || !distinct.insert(value) {
                continue;
            }
            if let Some(sample) = decode_feedback_pixel(value) {
                samples.push(sample);
            }
        }
    }
    Ok(samples)
}

/// Double-buffered driver of a [`FeedbackPass`]
pub struct SamplingRenderer<P: FeedbackPass> {
    pass: P,
    config: SamplingConfig,
    in_flight: VecDeque<FeedbackTarget>,
}

impl<P: FeedbackPass> SamplingRenderer<P> {
    /// Frames between rendering a target and reading it back
    pub const LATENCY: usize = 1;

    pub fn new(pass: P, config: SamplingConfig) -> ResidencyResult<Self> {
        config.validate()?;
        Ok(Self {
            pass,
            config,
            in_flight: VecDeque::with_capacity(Self::LATENCY + 1),
        })
    }

    pub fn pass(&self) -> &P {
        &self.pass
    }

    pub fn pass_mut(&mut self) -> &mut P {
        &mut self.pass
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Size of the feedback target
    pub fn target_size(&self) -> (u32, u32) {
        self.config.target_size()
    }

    /// Read back the oldest finished target, then render this frame's.
    ///
    /// Returns no samples until the first target has aged by [`Self::LATENCY`]
    /// frames.
    pub fn sample_frame(&mut self) -> ResidencyResult<Vec<DecodedSample>> {
        let samples = if self.in_flight.len() >= Self::LATENCY {
            match self.in_flight.pop_front() {
                Some(target) => decode_readback(&self.pass.read_back(&target)?)?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let (width, height) = self.target_size();
        let target = self.pass.render_feedback_pass(width, height)?;
        self.in_flight.push_back(target);
        Ok(samples)
    }

    /// Track a new screen size; targets already in flight keep their size
    pub fn resize(&mut self, screen_width: u32, screen_height: u32) {
        self.config.screen_width = screen_width;
        self.config.screen_height = screen_height;
        log::debug!(
            "Feedback target resized to {:?} for a {}x{} screen",
            self.config.target_size(),
            screen_width,
            screen_height
        );
    }
}

/// Camera the software pass renders from. Looks down `-Z` before rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackCamera {
    pub orientation: Quat,
    /// Vertical field of view in radians
    pub vertical_fov: f32,
}

impl FeedbackCamera {
    pub fn new(orientation: Quat, vertical_fov: f32) -> Self {
        Self {
            orientation,
            vertical_fov,
        }
    }

    /// Camera turned by `yaw` around `+Y`, then pitched by `pitch`
    pub fn from_yaw_pitch(yaw: f32, pitch: f32, vertical_fov: f32) -> Self {
        Self::new(Quat::from_rotation_y(yaw) * Quat::from_rotation_x(pitch), vertical_fov)
    }

    /// World-space direction through normalized device coordinates `(x, y)`
    pub fn ray(&self, ndc_x: f32, ndc_y: f32, aspect: f32) -> Vec3 {
        let tan = (self.vertical_fov * 0.5).tan();
        self.orientation * Vec3::new(ndc_x * tan * aspect, ndc_y * tan, -1.0)
    }
}

impl Default for FeedbackCamera {
    fn default() -> Self {
        Self::new(Quat::IDENTITY, std::f32::consts::FRAC_PI_2)
    }
}

/// CPU rasterizer of the feedback pass for a cube sky.
///
/// Every pixel sees the cube, so no pixel is left empty. The level of detail
/// is the log2 of texels per full-resolution pixel at the view centre.
#[derive(Debug)]
pub struct SoftwareFeedbackPass {
    camera: FeedbackCamera,
    face_size: u32,
    sampling_ratio: u32,
    next_id: u64,
    rendered: AHashMap<u64, FeedbackReadback>,
}

impl SoftwareFeedbackPass {
    /// `face_size` is the mip-0 edge of one cube face in texels
    pub fn new(camera: FeedbackCamera, face_size: u32, sampling_ratio: u32) -> Self {
        Self {
            camera,
            face_size,
            sampling_ratio: sampling_ratio.max(1),
            next_id: 0,
            rendered: AHashMap::new(),
        }
    }

    pub fn camera(&self) -> &FeedbackCamera {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: FeedbackCamera) {
        self.camera = camera;
    }

    /// Targets rendered but not yet read back
    pub fn pending_targets(&self) -> usize {
        self.rendered.len()
    }

    /// Level of detail wanted by a full-resolution screen `screen_height` pixels tall
    pub fn lod(&self, screen_height: u32) -> f32 {
        let tan = (self.camera.vertical_fov * 0.5).tan();
        let texels_per_pixel = self.face_size as f32 * tan / screen_height.max(1) as f32;
        texels_per_pixel.max(1.0).log2()
    }
}

impl FeedbackPass for SoftwareFeedbackPass {
    fn render_feedback_pass(&mut self, width: u32, height: u32) -> ResidencyResult<FeedbackTarget> {
        let row_pitch = (width as usize * FEEDBACK_PIXEL_BYTES).next_multiple_of(READBACK_PITCH_ALIGNMENT);
        let mut data = vec![0u8; row_pitch * height as usize];
        let lod = self.lod(height.saturating_mul(self.sampling_ratio));
        let aspect = width as f32 / height.max(1) as f32;

        for y in 0..height {
            let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
            let row = y as usize * row_pitch;
            for x in 0..width {
                let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
                let pixel = encode_feedback_pixel(self.camera.ray(ndc_x, ndc_y, aspect), lod);
                let offset = row + x as usize * FEEDBACK_PIXEL_BYTES;
                data[offset..offset + FEEDBACK_PIXEL_BYTES].copy_from_slice(&pixel.to_le_bytes());
            }
        }

        self.next_id += 1;
        let target = FeedbackTarget {
            id: self.next_id,
            width,
            height,
        };
        self.rendered.insert(
            target.id,
            FeedbackReadback {
                data,
                width,
                height,
                row_pitch,
            },
        );
        Ok(target)
    }

    fn read_back(&mut self, target: &FeedbackTarget) -> ResidencyResult<FeedbackReadback> {
        self.rendered
            .remove(&target.id)
            .ok_or_else(|| ResidencyError::InvalidReadback(format!("target {} was never rendered", target.id)))
    }
}
