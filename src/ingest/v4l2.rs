//! V4L2 camera capture.
//!
//! The driver is asked for RGB24 first, then YUYV, then NV12; whatever it
//! settles on is converted to RGB per frame. A camera never ends on its own,
//! so any capture error ends the stream.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use v4l::video::Capture;

use super::normalize::PixelFormat;
use super::CaptureDevice;
use crate::frame::Frame;

/// Number of mmap buffers queued with the driver.
const MMAP_BUFFERS: u32 = 4;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device node, e.g. `/dev/video0`.
    pub device: String,
    /// Requested rate; zero leaves the driver's choice alone.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 1280,
            height: 720,
        }
    }
}

/// What the driver agreed to deliver.
#[derive(Clone, Copy, Debug)]
struct Negotiated {
    format: PixelFormat,
    width: u32,
    height: u32,
}

#[self_referencing]
struct Capturing {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Device {
    config: V4l2Config,
    session: Option<(Capturing, Negotiated)>,
    captured: u64,
}

impl V4l2Device {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            session: None,
            captured: 0,
        }
    }
}

fn negotiate(device: &v4l::Device, config: &V4l2Config) -> Result<Negotiated> {
    let current = device
        .format()
        .with_context(|| format!("query format of {}", config.device))?;

    for wanted in PixelFormat::PREFERRED {
        let mut request = current.clone();
        request.width = config.width;
        request.height = config.height;
        request.fourcc = v4l::FourCC::new(wanted.fourcc());
        match device.set_format(&request) {
            Ok(granted) => {
                if let Some(format) = PixelFormat::from_fourcc(&granted.fourcc.repr) {
                    return Ok(Negotiated {
                        format,
                        width: granted.width,
                        height: granted.height,
                    });
                }
            }
            Err(err) => log::debug!("V4l2Device: {} refused {:?}: {}", config.device, wanted, err),
        }
    }

    // Nothing we asked for stuck; accept the current mode if we can decode it.
    PixelFormat::from_fourcc(&current.fourcc.repr)
        .map(|format| Negotiated {
            format,
            width: current.width,
            height: current.height,
        })
        .ok_or_else(|| {
            anyhow!(
                "{} only offers pixel format {}, which cannot be converted to RGB",
                config.device,
                current.fourcc
            )
        })
}

impl CaptureDevice for V4l2Device {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn connect(&mut self) -> Result<()> {
        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open camera {}", self.config.device))?;
        let negotiated = negotiate(&device, &self.config)?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Device: {} ignored {} fps request: {}",
                    self.config.device,
                    self.config.target_fps,
                    err
                );
            }
        }

        let capturing = CapturingTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    MMAP_BUFFERS,
                )
                .context("map capture buffers")
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Device: streaming {} at {}x{} {:?}",
            self.config.device,
            negotiated.width,
            negotiated.height,
            negotiated.format
        );
        self.session = Some((capturing, negotiated));
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (capturing, negotiated) = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("camera {} read before connect", self.config.device))?;
        let rgb = capturing.with_stream_mut(|stream| -> Result<Vec<u8>> {
            let (raw, _meta) = stream.next().context("dequeue camera buffer")?;
            negotiated
                .format
                .to_rgb(raw, negotiated.width, negotiated.height)
        })?;

        self.captured += 1;
        Frame::from_rgb(rgb, negotiated.width, negotiated.height, self.captured).map(Some)
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            log::debug!(
                "V4l2Device: closed {} after {} frames",
                self.config.device,
                self.captured
            );
        }
    }
}
