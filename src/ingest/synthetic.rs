//! Synthetic frame source (`stub://`).
//!
//! Generates a moving gradient so consecutive frames differ. Optionally
//! finite (`frames=N`) and paced (`fps=N`) to behave like a file or a camera.
//!
//! Source syntax after `stub://`: comma-separated tokens, e.g.
//! `frames=10,size=320x240,fps=30`. Unknown tokens name the stub.

use anyhow::{anyhow, Result};
use super::{CaptureDevice, Pacer};
use crate::frame::Frame;

/// Configuration for a synthetic source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Total frames before end of stream. `None` runs forever.
    pub frames: Option<u64>,
    /// Emulated native frame rate. `None` produces frames as fast as read;
    /// `open_device` fills it from the pipeline's target rate.
    pub fps: Option<u32>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            width: 640,
            height: 480,
            frames: None,
            fps: None,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some(("frames", value)) => {
                    cfg.frames = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("stub frames must be an integer: '{}'", value))?,
                    );
                }
                Some(("fps", value)) => {
                    let fps: u32 = value
                        .parse()
                        .map_err(|_| anyhow!("stub fps must be an integer: '{}'", value))?;
                    if fps == 0 {
                        return Err(anyhow!("stub fps must be >= 1"));
                    }
                    cfg.fps = Some(fps);
                }
                Some(("size", value)) => {
                    let (w, h) = value
                        .split_once('x')
                        .ok_or_else(|| anyhow!("stub size must look like 640x480: '{}'", value))?;
                    cfg.width = w
                        .parse()
                        .map_err(|_| anyhow!("invalid stub width '{}'", w))?;
                    cfg.height = h
                        .parse()
                        .map_err(|_| anyhow!("invalid stub height '{}'", h))?;
                    if cfg.width == 0 || cfg.height == 0 {
                        return Err(anyhow!("stub size must be non-zero"));
                    }
                }
                Some((key, _)) => return Err(anyhow!("unknown stub option '{}'", key)),
                None => cfg.name = token.to_string(),
            }
        }
        Ok(cfg)
    }
}

/// Synthetic capture device.
pub struct SyntheticDevice {
    config: SyntheticConfig,
    frame_count: u64,
    connected: bool,
    pacer: Pacer,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            pacer: Pacer::new(config.fps.unwrap_or(0)),
            config,
            frame_count: 0,
            connected: false,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let shift = (self.frame_count * 4) as usize;
        let mut pixels = vec![0u8; width * height * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift / 2) % 256) as u8;
            px[2] = ((x + y) % 256) as u8;
        }
        pixels
    }

}

impl CaptureDevice for SyntheticDevice {
    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticDevice: connected to stub://{} ({}x{})",
            self.config.name,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("synthetic device not connected"));
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.pacer.wait();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
        .map(Some)
    }

    fn release(&mut self) {
        self.connected = false;
        log::debug!(
            "SyntheticDevice: released stub://{} after {} frames",
            self.config.name,
            self.frame_count
        );
    }
}
