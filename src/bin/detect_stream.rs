//! detect_stream - real-time object detection on a camera or video file
//!
//! Runs until the source ends, ESC is pressed in the popup window, or
//! Ctrl-C. Annotated frames go to a popup window (`--use-popup`) or are
//! streamed as JPEG to a file and/or the preview HTTP server.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use detect_stream::config::{CliOverrides, PipelineConfig};
use detect_stream::detect::{DetectorBackend, StubBackend};
use detect_stream::display::{OutputSink, StreamSink};
use detect_stream::pipeline::{CancelToken, Pipeline};
use detect_stream::preprocess::InputShape;
use detect_stream::source::FrameSource;

/// Input size used when neither the model nor the config says otherwise.
const DEFAULT_INPUT_SIDE: u32 = 300;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera index, video file, image directory or stub://... source.
    #[arg(long)]
    source: Option<String>,
    /// Mirror frames horizontally (front-facing cameras).
    #[arg(long)]
    flip: bool,
    /// Show frames in a popup window; ESC stops.
    #[arg(long)]
    use_popup: bool,
    /// Frames to discard after the source opens.
    #[arg(long, value_name = "N")]
    skip_first_frames: Option<u32>,
    /// ONNX detection model (needs the backend-tract feature).
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,
    /// Minimum confidence for a kept detection.
    #[arg(long, value_name = "0..1")]
    confidence: Option<f32>,
    /// IoU above which overlapping boxes are suppressed.
    #[arg(long, value_name = "0..1")]
    nms: Option<f32>,
    /// Serve the latest frame over HTTP on this address.
    #[arg(long, value_name = "ADDR")]
    preview_addr: Option<String>,
    /// Replace this JPEG file with every annotated frame.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Class names, one per line.
    #[arg(long, value_name = "PATH")]
    labels: Option<PathBuf>,
}

impl Args {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            source: self.source,
            flip: self.flip.then_some(true),
            use_popup: self.use_popup.then_some(true),
            skip_first_frames: self.skip_first_frames,
            model_path: self.model,
            confidence_threshold: self.confidence,
            nms_threshold: self.nms,
            preview_addr: self.preview_addr,
            output_path: self.output,
            labels_path: self.labels,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = PipelineConfig::load_with(args.into_overrides())?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).expect("error setting Ctrl-C handler");

    let source = FrameSource::from_spec(&config.source, config.source_options())?;
    let detector = build_detector(&config)?;
    let sink = build_sink(&config)?;

    let mut pipeline = Pipeline::new(&config, source, detector, sink, cancel)?;
    let summary = pipeline.run()?;
    log::info!(
        "detect_stream: {} frames processed, {} dropped by the capture buffer",
        summary.frames_processed,
        summary.frames_dropped
    );
    if let Some(estimate) = summary.last_estimate {
        log::info!("detect_stream: {}", estimate.overlay_text());
    }
    Ok(())
}

fn build_detector(config: &PipelineConfig) -> Result<Box<dyn DetectorBackend>> {
    let shape = match config.input_shape()? {
        Some(shape) => shape,
        None => InputShape::new(DEFAULT_INPUT_SIDE, DEFAULT_INPUT_SIDE)?,
    };
    match &config.model_path {
        Some(path) => load_model(path, shape),
        None => {
            log::warn!("no model configured; the stub detector reports no detections");
            Ok(Box::new(StubBackend::new(shape)))
        }
    }
}

#[cfg(feature = "backend-tract")]
fn load_model(path: &std::path::Path, shape: InputShape) -> Result<Box<dyn DetectorBackend>> {
    Ok(Box::new(detect_stream::detect::TractBackend::new(path, shape)?))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model(path: &std::path::Path, _shape: InputShape) -> Result<Box<dyn DetectorBackend>> {
    anyhow::bail!(
        "model {} requires the backend-tract feature",
        path.display()
    )
}

fn build_sink(config: &PipelineConfig) -> Result<Box<dyn OutputSink>> {
    if config.use_popup {
        return popup_sink();
    }
    Ok(Box::new(StreamSink::new(config.stream.clone())?))
}

#[cfg(feature = "popup-minifb")]
fn popup_sink() -> Result<Box<dyn OutputSink>> {
    Ok(Box::new(detect_stream::display::PopupSink::new(
        "detect_stream",
    )))
}

#[cfg(not(feature = "popup-minifb"))]
fn popup_sink() -> Result<Box<dyn OutputSink>> {
    anyhow::bail!("popup output requires the popup-minifb feature")
}
