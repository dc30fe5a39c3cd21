//! Image-sequence frame source.
//!
//! Reads a directory of stills (sorted by file name) or a single image as a
//! finite stream. Decoding happens lazily, one file per `read()`, so a bad
//! file mid-sequence surfaces as a read error (end of stream for the
//! `FrameSource`). Reads are paced at the configured frame rate.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{CaptureDevice, Pacer};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub(crate) fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct ImageSequenceDevice {
    root: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    frame_count: u64,
    pacer: Pacer,
}

impl ImageSequenceDevice {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
            next: 0,
            frame_count: 0,
            pacer: Pacer::new(0),
        }
    }

    /// Hand out one image per `1/fps` seconds. Zero reads as fast as decoded.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.pacer = Pacer::new(fps);
        self
    }

    fn list_files(&self) -> Result<Vec<PathBuf>> {
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("read image directory {}", self.root.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_still_image(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl CaptureDevice for ImageSequenceDevice {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn connect(&mut self) -> Result<()> {
        self.files = self.list_files()?;
        if self.files.is_empty() {
            return Err(anyhow!("no images found in {}", self.root.display()));
        }
        self.next = 0;
        log::info!(
            "ImageSequenceDevice: connected to {} ({} images)",
            self.root.display(),
            self.files.len()
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        self.pacer.wait();
        let image = image::open(path)
            .with_context(|| format!("decode image {}", path.display()))?
            .into_rgb8();
        self.frame_count += 1;
        Ok(Some(Frame::new(image, self.frame_count)))
    }

    fn release(&mut self) {
        self.files.clear();
        log::debug!(
            "ImageSequenceDevice: released {} after {} frames",
            self.root.display(),
            self.frame_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn reads_directory_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8), ("c.png", 30u8)] {
            RgbImage::from_pixel(4, 3, Rgb([shade, shade, shade])).save(dir.path().join(name))?;
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut device = ImageSequenceDevice::new(dir.path());
        device.connect()?;
        let mut shades = Vec::new();
        while let Some(frame) = device.read()? {
            shades.push(frame.image().get_pixel(0, 0).0[0]);
        }
        assert_eq!(shades, vec![10, 20, 30]);
        Ok(())
    }

    #[test]
    fn single_image_is_one_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("still.png");
        RgbImage::new(5, 5).save(&path)?;
        let mut device = ImageSequenceDevice::new(&path);
        device.connect()?;
        assert!(device.read()?.is_some());
        assert!(device.read()?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_image_is_a_read_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg")?;
        let mut device = ImageSequenceDevice::new(dir.path());
        device.connect()?;
        assert!(device.read().is_err());
        Ok(())
    }

    #[test]
    fn paced_sequence_holds_frame_rate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["0.png", "1.png", "2.png"] {
            RgbImage::new(2, 2).save(dir.path().join(name))?;
        }
        let mut device = ImageSequenceDevice::new(dir.path()).with_fps(20);
        device.connect()?;
        let started = std::time::Instant::now();
        let mut frames = 0;
        while device.read()?.is_some() {
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert!(started.elapsed() >= std::time::Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn empty_directory_fails_to_connect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut device = ImageSequenceDevice::new(dir.path());
        assert!(device.connect().is_err());
        Ok(())
    }
}
