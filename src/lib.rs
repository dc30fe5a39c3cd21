//! Real-time object detection pipeline.
//!
//! Frames flow from a capture device through a single-slot buffer
//! (`source`), are resized for the detector (`preprocess`), run through a
//! `DetectorBackend` (`detect`), filtered with greedy NMS (`postprocess`),
//! annotated (`render`) and handed to a display sink (`display`). The
//! `pipeline` module ties these together and owns the stop/cleanup logic.
//!
//! # Module Structure
//!
//! - `frame`: owned RGB frames
//! - `ingest`: capture devices (synthetic, image sequence, FFmpeg file, V4L2)
//! - `source`: background capture with drop-oldest handoff
//! - `preprocess`: resolution cap and detector input tensor
//! - `detect`: detector boundary, raw output parsing, stub and tract backends
//! - `postprocess`: pixel boxes and NMS
//! - `render`: overlay plan and rasterisation
//! - `perf`: rolling inference-time window
//! - `display`: popup and streaming sinks, preview HTTP server
//! - `config`: layered configuration
//! - `pipeline`: the loop and its state machine

pub mod config;
pub mod detect;
pub mod display;
pub mod frame;
pub mod ingest;
pub mod perf;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod render;
pub mod source;

pub use config::PipelineConfig;
pub use detect::{DetectorBackend, RawDetection, StubBackend};
pub use display::OutputSink;
pub use frame::Frame;
pub use perf::{PerfEstimate, PerfMeter, RollingWindow};
pub use pipeline::{CancelToken, Pipeline, PipelineState, RunSummary, StopReason};
pub use postprocess::{Detection, PixelBox, PostProcessor};
pub use preprocess::{InputShape, Preprocessor};
pub use render::{LabelMap, OverlayPlan, Renderer};
pub use source::{FrameSource, SourceOptions};
