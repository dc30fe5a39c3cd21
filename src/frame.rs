//! Frame container.
//!
//! A `Frame` is a height x width x 3 grid of 8-bit RGB pixels plus its capture
//! sequence number. Frames move by value from the capture thread to the loop,
//! then to the renderer and the output sink. Frames are not `Clone`; exactly
//! one stage owns a frame at any time.

use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};
use std::time::{Duration, Instant};

/// Owned RGB frame.
pub struct Frame {
    image: RgbImage,
    /// Capture sequence number (1-based, counts every frame the device produced).
    index: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, index: u64) -> Self {
        Self {
            image,
            index,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from packed RGB24 bytes. The length must be exactly
    /// `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self::new(image, index))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Time since the frame left the capture device.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Mutable pixel access. Only the renderer draws into frames.
    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Swap in a resized image, keeping sequence number and capture time.
    pub(crate) fn with_image(self, image: RgbImage) -> Self {
        Self { image, ..self }
    }

    /// Mirror the frame around its vertical axis (front-facing cameras).
    pub fn flip_horizontal(&mut self) {
        imageops::flip_horizontal_in_place(&mut self.image);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}
