//! The detection loop.
//!
//! `Pipeline::run` drives one run through `Idle -> Running -> (Stopping |
//! Failed) -> Idle`. Each iteration pulls the freshest frame, preprocesses
//! it, runs the detector (the only timed step), post-processes, renders and
//! emits the frame. Every exit path goes through the same release sequence:
//! stop the frame source, then close the output sink.
//!
//! A pipeline runs once: the release sequence consumes the frame source and
//! closes the sink, so a second `run` is refused. Build a new `Pipeline` to
//! capture again.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::DetectorBackend;
use crate::display::{OutputSink, KEY_ESCAPE, KEY_POLL_TIMEOUT};
use crate::frame::Frame;
use crate::perf::{PerfEstimate, PerfMeter};
use crate::postprocess::PostProcessor;
use crate::preprocess::Preprocessor;
use crate::render::Renderer;
use crate::source::FrameSource;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The frame source reported end of stream.
    SourceEnded,
    /// ESC in the popup window.
    ExitKey,
    /// The cancel token was set.
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceEnded => write!(f, "Source ended"),
            Self::ExitKey => write!(f, "Exit key pressed"),
            Self::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// Cooperative cancellation flag, checked once per iteration.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub last_estimate: Option<PerfEstimate>,
}

pub struct Pipeline {
    source: FrameSource,
    detector: Box<dyn DetectorBackend>,
    sink: Box<dyn OutputSink>,
    preprocessor: Preprocessor,
    postprocessor: PostProcessor,
    renderer: Renderer,
    perf: PerfMeter,
    cancel: CancelToken,
    state: PipelineState,
    frames_processed: u64,
    spent: bool,
}

impl Pipeline {
    /// Assemble a pipeline. Label loading, font loading and the detector
    /// input-shape check happen here; any failure is a configuration error.
    pub fn new(
        config: &PipelineConfig,
        source: FrameSource,
        detector: Box<dyn DetectorBackend>,
        sink: Box<dyn OutputSink>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let labels = config.label_map()?;
        let num_classes = config.num_classes_for(&labels);
        let font = Renderer::load_font(config.font_path.as_deref())?;
        let renderer = Renderer::new(labels, num_classes, font);
        Self::with_renderer(config, source, detector, sink, cancel, renderer)
    }

    /// Like `new`, with a caller-built renderer.
    pub fn with_renderer(
        config: &PipelineConfig,
        source: FrameSource,
        detector: Box<dyn DetectorBackend>,
        sink: Box<dyn OutputSink>,
        cancel: CancelToken,
        renderer: Renderer,
    ) -> Result<Self> {
        config.validate()?;
        let shape = detector.input_shape();
        shape
            .validate()
            .with_context(|| format!("detector {} input shape", detector.name()))?;
        if let Some(configured) = config.input_shape()? {
            if configured != shape {
                return Err(anyhow!(
                    "configured input {} does not match detector {} input {}",
                    configured,
                    detector.name(),
                    shape
                ));
            }
        }
        Ok(Self {
            source,
            detector,
            sink,
            preprocessor: Preprocessor::new(shape, config.max_side)?,
            postprocessor: config.postprocessor()?,
            renderer,
            perf: PerfMeter::default(),
            cancel,
            state: PipelineState::Idle,
            frames_processed: 0,
            spent: false,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether `run` has been called. A spent pipeline stays `Idle`.
    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run until end of stream, ESC or cancellation.
    ///
    /// Start failures (detector warm-up, device open) and mid-loop errors
    /// are returned after the release sequence has run. Only the first call
    /// runs; later calls fail without touching the source or sink.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state != PipelineState::Idle {
            return Err(anyhow!("pipeline is {:?}, expected Idle", self.state));
        }
        if self.spent {
            return Err(anyhow!(
                "pipeline already ran and released {}; build a new one to run again",
                self.source.target()
            ));
        }
        self.spent = true;

        if let Err(err) = self.start() {
            self.transition(PipelineState::Failed);
            self.release();
            self.transition(PipelineState::Idle);
            log::error!("Pipeline failed to start: {:#}", err);
            return Err(err);
        }

        self.transition(PipelineState::Running);
        let outcome = self.run_loop();
        self.transition(match outcome {
            Ok(_) => PipelineState::Stopping,
            Err(_) => PipelineState::Failed,
        });
        self.release();
        self.transition(PipelineState::Idle);

        match outcome {
            Ok(reason) => {
                match reason {
                    StopReason::Interrupted => log::warn!("{}", reason),
                    StopReason::SourceEnded | StopReason::ExitKey => log::info!("{}", reason),
                }
                Ok(self.summary(reason))
            }
            Err(err) => {
                log::error!("Pipeline failed: {:#}", err);
                Err(err)
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        log::info!(
            "Pipeline: detector {} ({}), output {}",
            self.detector.name(),
            self.preprocessor.shape(),
            self.sink.name()
        );
        self.detector.warm_up().context("detector warm-up")?;
        self.source
            .start()
            .with_context(|| format!("open frame source {}", self.source.target()))
    }

    fn run_loop(&mut self) -> Result<StopReason> {
        let mut last_health = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Interrupted);
            }
            let Some(frame) = self.source.next()? else {
                return Ok(StopReason::SourceEnded);
            };
            // A frame pulled after cancellation is dropped unprocessed.
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Interrupted);
            }

            self.process_frame(frame)
                .with_context(|| format!("frame {}", self.frames_processed + 1))?;
            self.frames_processed += 1;

            if self.sink.is_interactive() {
                if let Some(KEY_ESCAPE) = self.sink.poll_key(KEY_POLL_TIMEOUT)? {
                    return Ok(StopReason::ExitKey);
                }
            }

            if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health();
                last_health = Instant::now();
            }
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<()> {
        let mut frame = self.preprocessor.limit_resolution(frame)?;
        let input = self.preprocessor.prepare(&frame)?;

        let started = Instant::now();
        let raw = self.detector.infer(&input)?;
        self.perf.record(started.elapsed());

        let detections = self
            .postprocessor
            .process(frame.width(), frame.height(), &raw);
        let estimate = self.perf.estimate();
        let plan = self
            .renderer
            .render(&mut frame, &detections, estimate.as_ref());
        log::trace!(
            "frame {}: {} detections from {} raw records, {:?} since capture",
            frame.index(),
            detections.len(),
            raw.len(),
            frame.age()
        );
        self.sink.emit(&frame, &plan, estimate.as_ref())
    }

    fn release(&mut self) {
        self.source.stop();
        self.sink.close();
    }

    fn log_health(&self) {
        let dropped = self.source.stats().frames_dropped;
        match self.perf.estimate() {
            Some(estimate) => log::info!(
                "Pipeline: {} frames, {:.1}ms mean inference ({:.1} FPS), {} dropped",
                self.frames_processed,
                estimate.mean_ms,
                estimate.fps,
                dropped
            ),
            None => log::info!(
                "Pipeline: {} frames, {} dropped",
                self.frames_processed,
                dropped
            ),
        }
    }

    fn summary(&self, reason: StopReason) -> RunSummary {
        RunSummary {
            reason,
            frames_processed: self.frames_processed,
            frames_dropped: self.source.stats().frames_dropped,
            last_estimate: self.perf.estimate(),
        }
    }

    fn transition(&mut self, next: PipelineState) {
        log::debug!("Pipeline: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{RawDetection, StubBackend};
    use crate::ingest::{SyntheticConfig, SyntheticDevice};
    use crate::preprocess::InputShape;
    use crate::render::{LabelMap, OverlayPlan};
    use crate::source::SourceOptions;

    /// Sink that reports the same key after every frame.
    #[derive(Default)]
    struct KeySink {
        key: Option<u32>,
    }

    impl OutputSink for KeySink {
        fn name(&self) -> &'static str {
            "keys"
        }
        fn emit(&mut self, _: &Frame, _: &OverlayPlan, _: Option<&PerfEstimate>) -> Result<()> {
            Ok(())
        }
        fn is_interactive(&self) -> bool {
            self.key.is_some()
        }
        fn poll_key(&mut self, _: Duration) -> Result<Option<u32>> {
            Ok(self.key)
        }
    }

    fn source(frames: u64) -> FrameSource {
        FrameSource::new(
            Box::new(SyntheticDevice::new(SyntheticConfig {
                width: 64,
                height: 48,
                frames: Some(frames),
                ..SyntheticConfig::default()
            })),
            SourceOptions::default(),
        )
    }

    fn pipeline(
        frames: u64,
        detector: StubBackend,
        sink: KeySink,
        config: &PipelineConfig,
    ) -> Result<Pipeline> {
        Pipeline::with_renderer(
            config,
            source(frames),
            Box::new(detector),
            Box::new(sink),
            CancelToken::new(),
            Renderer::new(LabelMap::default(), 91, Renderer::embedded_font()?),
        )
    }

    fn shape() -> InputShape {
        InputShape::new(32, 24).unwrap()
    }

    #[test]
    fn shape_mismatch_is_rejected_before_running() {
        let config = PipelineConfig {
            input_width: Some(300),
            input_height: Some(300),
            ..PipelineConfig::default()
        };
        let result = pipeline(1, StubBackend::new(shape()), KeySink::default(), &config);
        assert!(result.is_err());
    }

    #[test]
    fn exit_key_stops_after_first_frame() -> Result<()> {
        let sink = KeySink { key: Some(KEY_ESCAPE) };
        let mut pipeline = pipeline(
            1000,
            StubBackend::new(shape()),
            sink,
            &PipelineConfig::default(),
        )?;
        let summary = pipeline.run()?;
        assert_eq!(summary.reason, StopReason::ExitKey);
        assert_eq!(summary.frames_processed, 1);
        assert_eq!(pipeline.state(), PipelineState::Idle);
        Ok(())
    }

    #[test]
    fn other_keys_do_not_stop() -> Result<()> {
        let sink = KeySink { key: Some(b'q' as u32) };
        let mut pipeline = pipeline(5, StubBackend::new(shape()), sink, &PipelineConfig::default())?;
        let summary = pipeline.run()?;
        assert_eq!(summary.reason, StopReason::SourceEnded);
        assert!(summary.frames_processed >= 1);
        Ok(())
    }

    #[test]
    fn cancelled_before_run_processes_nothing() -> Result<()> {
        let detector = StubBackend::new(shape());
        let calls = detector.call_counter();
        let mut pipeline = pipeline(
            10,
            detector,
            KeySink::default(),
            &PipelineConfig::default(),
        )?;
        pipeline.cancel_token().cancel();
        let summary = pipeline.run()?;
        assert_eq!(summary.reason, StopReason::Interrupted);
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn detector_errors_fail_the_run_after_release() -> Result<()> {
        struct Broken;
        impl DetectorBackend for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn input_shape(&self) -> InputShape {
                InputShape::new(32, 24).unwrap()
            }
            fn infer(&mut self, _: &crate::preprocess::InputTensor) -> Result<Vec<RawDetection>> {
                Err(anyhow!("accelerator lost"))
            }
        }
        let mut pipeline = Pipeline::with_renderer(
            &PipelineConfig::default(),
            source(10),
            Box::new(Broken),
            Box::new(KeySink::default()),
            CancelToken::new(),
            Renderer::new(LabelMap::default(), 91, Renderer::embedded_font()?),
        )?;
        let err = pipeline.run().unwrap_err();
        assert!(format!("{:#}", err).contains("accelerator lost"));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        Ok(())
    }

    #[test]
    fn second_run_is_refused_with_a_clear_error() -> Result<()> {
        let detector = StubBackend::new(shape());
        let calls = detector.call_counter();
        let mut pipeline = pipeline(3, detector, KeySink::default(), &PipelineConfig::default())?;
        assert!(!pipeline.is_spent());
        pipeline.run()?;
        assert!(pipeline.is_spent());
        let after_first = calls.load(Ordering::SeqCst);

        let err = pipeline.run().unwrap_err();
        assert!(err.to_string().contains("already ran"), "{}", err);
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
        Ok(())
    }

    #[test]
    fn stop_reasons_log_expected_text() {
        assert_eq!(StopReason::SourceEnded.to_string(), "Source ended");
        assert_eq!(StopReason::Interrupted.to_string(), "Interrupted");
    }
}
