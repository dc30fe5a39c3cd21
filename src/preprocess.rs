//! Geometric preprocessing.
//!
//! Two steps, both area-averaging (box-filter convolution):
//! 1. `limit_resolution`: frames whose longer side exceeds `max_side` are
//!    downscaled uniformly so the longer side equals `max_side`. The result
//!    replaces the frame for the rest of the iteration (it is what gets
//!    annotated and displayed).
//! 2. `prepare`: plain resize (no letterboxing) to the detector's fixed
//!    width/height, packed as a `[1, H, W, 3]` u8 tensor.

use anyhow::{anyhow, Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use ndarray::Array4;

use crate::frame::Frame;

/// Longest side a frame may keep before detection.
pub const MAX_FRAME_SIDE: u32 = 1280;

/// Detector input tensor, NHWC with a batch of one.
pub type InputTensor = Array4<u8>;

/// Fixed detector input size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
}

impl InputShape {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let shape = Self { width, height };
        shape.validate()?;
        Ok(shape)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "invalid input shape {}x{}: dimensions must be positive",
                self.width,
                self.height
            ));
        }
        Ok(())
    }

    /// Tensor dimensions `[1, H, W, 3]`.
    pub fn tensor_dims(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, 3]
    }
}

impl std::fmt::Display for InputShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Reusable preprocessor; keeps the resizer's scratch buffers between frames.
pub struct Preprocessor {
    shape: InputShape,
    max_side: u32,
    resizer: fr::Resizer,
}

impl Preprocessor {
    pub fn new(shape: InputShape, max_side: u32) -> Result<Self> {
        shape.validate()?;
        if max_side == 0 {
            return Err(anyhow!("max frame side must be positive"));
        }
        Ok(Self {
            shape,
            max_side,
            resizer: fr::Resizer::new(),
        })
    }

    pub fn shape(&self) -> InputShape {
        self.shape
    }

    /// Downscale oversized frames. Frames within bounds pass through untouched.
    pub fn limit_resolution(&mut self, frame: Frame) -> Result<Frame> {
        let (width, height) = (frame.width(), frame.height());
        let Some((new_width, new_height)) = bounded_size(width, height, self.max_side) else {
            return Ok(frame);
        };
        let pixels = resize_area(&mut self.resizer, frame.image(), new_width, new_height)?;
        let image = RgbImage::from_raw(new_width, new_height, pixels)
            .ok_or_else(|| anyhow!("resized buffer does not fit {}x{}", new_width, new_height))?;
        log::trace!(
            "downscaled frame {} from {}x{} to {}x{}",
            frame.index(),
            width,
            height,
            new_width,
            new_height
        );
        Ok(frame.with_image(image))
    }

    /// Resize to the detector input and add the batch dimension.
    pub fn prepare(&mut self, frame: &Frame) -> Result<InputTensor> {
        prepare_with(&mut self.resizer, frame, self.shape)
    }
}

/// One-shot `prepare` with a throwaway resizer.
pub fn prepare(frame: &Frame, shape: InputShape) -> Result<InputTensor> {
    prepare_with(&mut fr::Resizer::new(), frame, shape)
}

fn prepare_with(resizer: &mut fr::Resizer, frame: &Frame, shape: InputShape) -> Result<InputTensor> {
    shape.validate()?;
    let pixels = resize_area(resizer, frame.image(), shape.width, shape.height)?;
    Array4::from_shape_vec(
        (1, shape.height as usize, shape.width as usize, 3),
        pixels,
    )
    .context("pack input tensor")
}

/// Target size when the longer side exceeds `max_side`, `None` otherwise.
fn bounded_size(width: u32, height: u32, max_side: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= max_side {
        return None;
    }
    let scale = max_side as f64 / longest as f64;
    let scaled = |side: u32| {
        if side == longest {
            max_side
        } else {
            ((side as f64 * scale).round() as u32).max(1)
        }
    };
    Some((scaled(width), scaled(height)))
}

fn resize_area(
    resizer: &mut fr::Resizer,
    image: &RgbImage,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    if image.width() == width && image.height() == height {
        return Ok(image.as_raw().clone());
    }
    let src = fr::images::ImageRef::new(
        image.width(),
        image.height(),
        image.as_raw(),
        fr::PixelType::U8x3,
    )
    .context("wrap frame for resize")?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);
    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("area resize")?;
    Ok(dst.buffer().to_vec())
}
