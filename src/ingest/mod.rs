//! Frame ingestion backends.
//!
//! This module provides the capture devices behind a `FrameSource`:
//! - Synthetic `stub://` device (tests, demos)
//! - Image sequences: a directory of stills or a single image
//! - Local video files (feature: ingest-file-ffmpeg)
//! - USB/V4L2 cameras by index (feature: ingest-v4l2)
//!
//! Every device yields RGB `Frame`s. `read()` returning `Ok(None)` means the
//! stream is exhausted; an `Err` from `read()` is a decode/device failure and
//! is treated by the `FrameSource` as end of stream, never retried.

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod images;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub use images::ImageSequenceDevice;
pub use synthetic::{SyntheticConfig, SyntheticDevice};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Device;

/// A capture collaborator: a camera, a file decoder or a synthetic generator.
///
/// Devices are moved onto the capture thread after `connect`, hence `Send`.
pub trait CaptureDevice: Send {
    /// Human-readable target for logs (device path, file path, stub name).
    fn describe(&self) -> String;

    /// Open the underlying device. Failures here are fatal for the run.
    fn connect(&mut self) -> Result<()>;

    /// Read the next frame. `Ok(None)` signals a finite source is exhausted.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the device. Called exactly once, from the capture thread.
    fn release(&mut self);
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// Camera by integer index (`/dev/video<N>` on Linux).
    Camera(u32),
    /// Local video file, image directory or still image.
    File(PathBuf),
    /// Synthetic generator, e.g. `stub://frames=10`.
    Synthetic(String),
}

impl SourceSpec {
    /// Parse a CLI/config source string.
    ///
    /// All-digit strings are camera indices, `stub://...` is synthetic,
    /// anything else is a local path. URL schemes other than `stub://` are
    /// rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if let Some(rest) = raw.strip_prefix("stub://") {
            return Ok(Self::Synthetic(rest.to_string()));
        }
        if raw.contains("://") {
            return Err(anyhow!(
                "unsupported source '{}': only camera indices, local paths and stub:// are accepted",
                raw
            ));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            let index = raw
                .parse::<u32>()
                .map_err(|_| anyhow!("camera index '{}' is out of range", raw))?;
            return Ok(Self::Camera(index));
        }
        Ok(Self::File(PathBuf::from(raw)))
    }

    /// Whether the source ends on its own (files, finite stubs).
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Camera(_) => false,
            Self::File(_) => true,
            Self::Synthetic(spec) => SyntheticConfig::parse(spec)
                .map(|cfg| cfg.frames.is_some())
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera(index) => write!(f, "{}", index),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Synthetic(spec) => write!(f, "stub://{}", spec),
        }
    }
}

/// Build (but do not connect) the device for a source.
///
/// `target_fps` is requested from camera drivers and paces every other
/// source: files and stubs are read one frame per period instead of as fast
/// as they decode. Zero keeps the driver's rate and leaves other sources
/// unpaced. A stub's own `fps=` option wins over `target_fps`.
pub fn open_device(spec: &SourceSpec, target_fps: u32) -> Result<Box<dyn CaptureDevice>> {
    match spec {
        SourceSpec::Synthetic(raw) => {
            let mut config = SyntheticConfig::parse(raw)?;
            config.fps = config.fps.or((target_fps > 0).then_some(target_fps));
            Ok(Box::new(SyntheticDevice::new(config)))
        }
        SourceSpec::Camera(index) => open_camera(*index, target_fps),
        SourceSpec::File(path) => open_file(path, target_fps),
    }
}

/// Releases reads at a fixed frame rate.
///
/// Each frame is due one period after the previous one was due, so slow
/// decodes are caught up rather than accumulating drift.
#[derive(Debug)]
pub(crate) struct Pacer {
    period: Option<Duration>,
    due: Option<Instant>,
}

impl Pacer {
    /// Zero fps never blocks.
    pub(crate) fn new(fps: u32) -> Self {
        Self {
            period: (fps > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(fps))),
            due: None,
        }
    }

    /// Block until the next frame is due. The first call never blocks.
    pub(crate) fn wait(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let now = Instant::now();
        self.due = match self.due {
            Some(due) if due > now => {
                std::thread::sleep(due - now);
                Some(due + period)
            }
            _ => Some(now + period),
        };
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_camera(index: u32, target_fps: u32) -> Result<Box<dyn CaptureDevice>> {
    Ok(Box::new(V4l2Device::new(v4l2::V4l2Config {
        device: format!("/dev/video{}", index),
        target_fps,
        ..v4l2::V4l2Config::default()
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_camera(index: u32, _target_fps: u32) -> Result<Box<dyn CaptureDevice>> {
    Err(anyhow!(
        "camera {} requested but camera capture requires the ingest-v4l2 feature",
        index
    ))
}

fn open_file(path: &Path, target_fps: u32) -> Result<Box<dyn CaptureDevice>> {
    if !path.exists() {
        return Err(anyhow!("source {} does not exist", path.display()));
    }
    if path.is_dir() || images::is_still_image(path) {
        return Ok(Box::new(ImageSequenceDevice::new(path).with_fps(target_fps)));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(file_ffmpeg::FfmpegFileDevice::new(path, target_fps)))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(anyhow!(
            "video file {} requires the ingest-file-ffmpeg feature",
            path.display()
        ))
    }
}
