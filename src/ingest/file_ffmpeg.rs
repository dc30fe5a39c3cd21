//! Video files decoded through FFmpeg.
//!
//! Only the best video stream is decoded. Once the demuxer runs dry the
//! decoder is flushed, so frames it still buffers are delivered before the
//! source reports end of stream. Frames are handed out at the configured
//! rate rather than as fast as they decode.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::software::scaling;
use std::path::{Path, PathBuf};

use super::{CaptureDevice, Pacer};
use crate::frame::Frame;

struct Decoding {
    demuxer: ffmpeg::format::context::Input,
    video_stream: usize,
    decoder: ffmpeg::codec::decoder::Video,
    to_rgb: scaling::Context,
    flushed: bool,
}

impl Decoding {
    fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let demuxer = ffmpeg::format::input(&path)
            .with_context(|| format!("open video file {}", path.display()))?;
        let stream = demuxer
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} contains no video stream", path.display()))?;
        let video_stream = stream.index();
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|codec| codec.decoder().video())
            .with_context(|| format!("set up decoder for {}", path.display()))?;
        let to_rgb = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::Flags::BILINEAR,
        )
        .context("set up RGB conversion")?;
        Ok(Self {
            demuxer,
            video_stream,
            decoder,
            to_rgb,
            flushed: false,
        })
    }

    /// Feed the decoder one more packet of our stream. False once flushed.
    fn feed(&mut self) -> Result<bool> {
        if self.flushed {
            return Ok(false);
        }
        let next = self
            .demuxer
            .packets()
            .find(|(stream, _)| stream.index() == self.video_stream);
        match next {
            Some((_, packet)) => self.decoder.send_packet(&packet).context("decode packet")?,
            None => {
                self.decoder.send_eof().context("flush decoder")?;
                self.flushed = true;
            }
        }
        Ok(true)
    }

    fn next_picture(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut picture = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut picture).is_ok() {
                return Ok(Some(picture));
            }
            if !self.feed()? {
                return Ok(None);
            }
        }
    }
}

/// Tightly packed RGB rows out of a possibly padded plane.
fn packed_rgb(picture: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
    let row_len = picture.width() as usize * 3;
    let rows = picture.height() as usize;
    let stride = picture.stride(0);
    let plane = picture.data(0);
    if stride < row_len || plane.len() < stride * rows.saturating_sub(1) + row_len {
        return Err(anyhow!(
            "decoded plane of {} bytes (stride {}) is too small for {}x{}",
            plane.len(),
            stride,
            picture.width(),
            picture.height()
        ));
    }
    Ok(plane
        .chunks(stride)
        .take(rows)
        .flat_map(|row| &row[..row_len])
        .copied()
        .collect())
}

pub(crate) struct FfmpegFileDevice {
    path: PathBuf,
    decoding: Option<Decoding>,
    decoded: u64,
    pacer: Pacer,
}

impl FfmpegFileDevice {
    pub(crate) fn new(path: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            path: path.into(),
            decoding: None,
            decoded: 0,
            pacer: Pacer::new(fps),
        }
    }
}

impl CaptureDevice for FfmpegFileDevice {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn connect(&mut self) -> Result<()> {
        let decoding = Decoding::open(&self.path)?;
        log::info!(
            "FfmpegFileDevice: decoding {} ({}x{})",
            self.path.display(),
            decoding.decoder.width(),
            decoding.decoder.height()
        );
        self.decoding = Some(decoding);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let decoding = self
            .decoding
            .as_mut()
            .ok_or_else(|| anyhow!("{} read before connect", self.path.display()))?;
        let Some(picture) = decoding.next_picture()? else {
            return Ok(None);
        };
        let mut rgb = ffmpeg::frame::Video::empty();
        decoding
            .to_rgb
            .run(&picture, &mut rgb)
            .context("convert frame to RGB")?;
        self.decoded += 1;
        self.pacer.wait();
        Frame::from_rgb(packed_rgb(&rgb)?, rgb.width(), rgb.height(), self.decoded).map(Some)
    }

    fn release(&mut self) {
        if self.decoding.take().is_some() {
            log::debug!(
                "FfmpegFileDevice: closed {} after {} frames",
                self.path.display(),
                self.decoded
            );
        }
    }
}
