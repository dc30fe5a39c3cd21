//! Streaming output: JPEG-encodes each annotated frame, replaces an output
//! file and publishes to the preview server.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::server::{PreviewHandle, PreviewServer};
use super::OutputSink;
use crate::frame::Frame;
use crate::perf::PerfEstimate;
use crate::render::OverlayPlan;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// File replaced with every encoded frame.
    pub output_path: Option<PathBuf>,
    /// Address for the preview HTTP server.
    pub preview_addr: Option<String>,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            preview_addr: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Counters served by the preview `/stats` route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PreviewStats {
    pub frames: u64,
    pub frame_index: u64,
    pub mean_ms: Option<f64>,
    pub fps: Option<f64>,
}

#[derive(Default)]
struct PreviewState {
    jpeg: Option<Arc<Vec<u8>>>,
    stats: PreviewStats,
}

/// The most recent encoded frame. Each publish replaces the previous one.
#[derive(Clone, Default)]
pub struct PreviewSlot {
    state: Arc<Mutex<PreviewState>>,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, PreviewState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("preview slot lock poisoned"))
    }

    pub fn publish(
        &self,
        jpeg: Vec<u8>,
        frame_index: u64,
        estimate: Option<&PerfEstimate>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        state.jpeg = Some(Arc::new(jpeg));
        state.stats.frames += 1;
        state.stats.frame_index = frame_index;
        state.stats.mean_ms = estimate.map(|e| e.mean_ms);
        state.stats.fps = estimate.map(|e| e.fps).filter(|fps| fps.is_finite());
        Ok(())
    }

    pub fn latest(&self) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self.lock()?.jpeg.clone())
    }

    pub fn stats(&self) -> Result<PreviewStats> {
        Ok(self.lock()?.stats)
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode JPEG")?;
    Ok(buf)
}

/// Streaming display: encode, then replace the previously shown image.
pub struct StreamSink {
    config: StreamConfig,
    slot: PreviewSlot,
    server: Option<PreviewHandle>,
}

impl StreamSink {
    /// Build the sink, starting the preview server if an address is set.
    pub fn new(config: StreamConfig) -> Result<Self> {
        let slot = PreviewSlot::new();
        let server = match &config.preview_addr {
            Some(addr) => Some(PreviewServer::new(addr.clone()).spawn(slot.clone())?),
            None => None,
        };
        if config.output_path.is_none() && server.is_none() {
            log::warn!("StreamSink: no output file or preview address, frames are only encoded");
        }
        Ok(Self {
            config,
            slot,
            server,
        })
    }

    pub fn slot(&self) -> PreviewSlot {
        self.slot.clone()
    }

    pub fn preview_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(|handle| handle.addr)
    }
}

impl OutputSink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn emit(
        &mut self,
        frame: &Frame,
        _plan: &OverlayPlan,
        estimate: Option<&PerfEstimate>,
    ) -> Result<()> {
        let jpeg = encode_jpeg(frame.image(), self.config.jpeg_quality)?;
        if let Some(path) = &self.config.output_path {
            replace_file(path, &jpeg)?;
        }
        self.slot.publish(jpeg, frame.index(), estimate)
    }

    fn close(&mut self) {
        if let Some(server) = self.server.take() {
            let addr = server.addr;
            match server.stop() {
                Ok(()) => log::info!("StreamSink: preview server on {} stopped", addr),
                Err(err) => log::warn!("StreamSink: preview server on {}: {:#}", addr, err),
            }
        }
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write to a sibling temp file and rename over `path`.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("output path {} has no file name", path.display()))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame(index: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(16, 8, Rgb([10, 200, 30])), index)
    }

    #[test]
    fn jpeg_output_decodes() -> Result<()> {
        let jpeg = encode_jpeg(frame(1).image(), 90)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg)?.into_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        Ok(())
    }

    #[test]
    fn sink_replaces_output_file_and_slot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("latest.jpg");
        let mut sink = StreamSink::new(StreamConfig {
            output_path: Some(path.clone()),
            ..StreamConfig::default()
        })?;
        let slot = sink.slot();
        let estimate = PerfEstimate {
            mean_ms: 5.0,
            fps: 200.0,
        };
        for index in 1..=3 {
            sink.emit(&frame(index), &OverlayPlan::default(), Some(&estimate))?;
        }
        sink.close();

        assert!(image::open(&path).is_ok());
        let entries = std::fs::read_dir(dir.path())?.count();
        assert_eq!(entries, 1, "temp file left behind");

        let stats = slot.stats()?;
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.frame_index, 3);
        assert_eq!(stats.fps, Some(200.0));
        assert!(slot.latest()?.is_some());
        Ok(())
    }

    #[test]
    fn empty_slot_has_no_frame() -> Result<()> {
        let slot = PreviewSlot::new();
        assert!(slot.latest()?.is_none());
        assert_eq!(slot.stats()?.frames, 0);
        Ok(())
    }
}
