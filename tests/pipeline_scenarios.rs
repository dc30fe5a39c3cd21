use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use detect_stream::ingest::{CaptureDevice, SourceSpec, SyntheticConfig, SyntheticDevice};
use detect_stream::preprocess::InputShape;
use detect_stream::{
    CancelToken, Frame, FrameSource, LabelMap, OutputSink, OverlayPlan, PerfEstimate, Pipeline,
    PipelineConfig, PipelineState, RawDetection, Renderer, SourceOptions, StopReason, StubBackend,
};

/// Synthetic device that only produces the next frame once the previous one
/// was emitted, so no frame is dropped by the single-slot buffer.
struct LockstepDevice {
    inner: SyntheticDevice,
    gate: Receiver<()>,
    cancel: CancelToken,
    produced: u64,
    releases: Arc<AtomicUsize>,
}

impl CaptureDevice for LockstepDevice {
    fn describe(&self) -> String {
        "lockstep".to_string()
    }

    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.produced > 0 {
            loop {
                match self.gate.recv_timeout(Duration::from_millis(10)) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Timeout) if self.cancel.is_cancelled() => {
                        return Ok(None)
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Ok(None),
                }
            }
        }
        self.produced += 1;
        self.inner.read()
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Recorded {
    frames: Vec<u64>,
    rects: Vec<usize>,
    texts: Vec<Vec<String>>,
    closes: usize,
}

struct RecordingSink {
    log: Arc<Mutex<Recorded>>,
    gate: Sender<()>,
}

impl OutputSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn emit(
        &mut self,
        frame: &Frame,
        plan: &OverlayPlan,
        _estimate: Option<&PerfEstimate>,
    ) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.frames.push(frame.index());
        log.rects.push(plan.rect_count());
        log.texts.push(plan.texts().map(str::to_string).collect());
        drop(log);
        let _ = self.gate.send(());
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }
}

struct Harness {
    pipeline: Pipeline,
    log: Arc<Mutex<Recorded>>,
    releases: Arc<AtomicUsize>,
    cancel: CancelToken,
}

fn harness(frames: u64, detector: StubBackend) -> Result<Harness> {
    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let releases = Arc::new(AtomicUsize::new(0));
    let device = LockstepDevice {
        inner: SyntheticDevice::new(SyntheticConfig {
            width: 640,
            height: 480,
            frames: Some(frames),
            ..SyntheticConfig::default()
        }),
        gate: rx,
        cancel: cancel.clone(),
        produced: 0,
        releases: releases.clone(),
    };
    let log = Arc::new(Mutex::new(Recorded::default()));
    let sink = RecordingSink {
        log: log.clone(),
        gate: tx,
    };
    let pipeline = Pipeline::with_renderer(
        &PipelineConfig::default(),
        FrameSource::new(Box::new(device), SourceOptions::default()),
        Box::new(detector),
        Box::new(sink),
        cancel.clone(),
        Renderer::new(
            LabelMap::new(vec!["person".to_string()]),
            1,
            Renderer::embedded_font()?,
        ),
    )?;
    Ok(Harness {
        pipeline,
        log,
        releases,
        cancel,
    })
}

fn shape() -> InputShape {
    InputShape::new(300, 300).unwrap()
}

fn one_box() -> RawDetection {
    RawDetection::new(0, 0.95, 0.1, 0.1, 0.5, 0.5)
}

#[test]
fn ten_frame_source_renders_ten_frames_then_ends() -> Result<()> {
    let detector = StubBackend::new(shape())
        .with_detections(vec![one_box()])
        .with_padding(100);
    let mut h = harness(10, detector)?;

    let summary = h.pipeline.run()?;

    assert_eq!(summary.reason, StopReason::SourceEnded);
    assert_eq!(summary.frames_processed, 10);
    assert_eq!(summary.frames_dropped, 0);
    assert!(summary.last_estimate.is_some());
    assert_eq!(h.pipeline.state(), PipelineState::Idle);

    let log = h.log.lock().unwrap();
    assert_eq!(log.frames, (1..=10).collect::<Vec<u64>>());
    assert!(log.rects.iter().all(|&rects| rects == 1));
    assert!(log
        .texts
        .iter()
        .all(|texts| texts[0] == "person 0.95" && texts[1].starts_with("Inference time: ")));
    assert_eq!(log.closes, 1);
    assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn finite_stub_source_is_paced_so_no_frame_is_dropped() -> Result<()> {
    let config = PipelineConfig {
        source: SourceSpec::parse("stub://frames=10,size=160x120")?,
        target_fps: 10,
        ..PipelineConfig::default()
    };
    let log = Arc::new(Mutex::new(Recorded::default()));
    let (tx, _rx) = mpsc::channel();
    let sink = RecordingSink {
        log: log.clone(),
        gate: tx,
    };
    let mut pipeline = Pipeline::new(
        &config,
        FrameSource::from_spec(&config.source, config.source_options())?,
        Box::new(StubBackend::new(shape()).with_detections(vec![one_box()])),
        Box::new(sink),
        CancelToken::new(),
    )?;

    let summary = pipeline.run()?;

    assert_eq!(summary.reason, StopReason::SourceEnded);
    assert_eq!(summary.frames_processed, 10);
    assert_eq!(summary.frames_dropped, 0);
    let log = log.lock().unwrap();
    assert_eq!(log.frames, (1..=10).collect::<Vec<u64>>());
    assert!(log.rects.iter().all(|&rects| rects == 1));
    assert_eq!(log.closes, 1);
    Ok(())
}

#[test]
fn zero_detections_still_draw_the_overlay() -> Result<()> {
    let detector = StubBackend::new(shape()).with_padding(100);
    let mut h = harness(6, detector)?;

    let summary = h.pipeline.run()?;

    assert_eq!(summary.reason, StopReason::SourceEnded);
    assert_eq!(summary.frames_processed, 6);
    let log = h.log.lock().unwrap();
    assert_eq!(log.frames.len(), 6);
    assert!(log.rects.iter().all(|&rects| rects == 0));
    for texts in &log.texts {
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("Inference time: "));
        assert!(texts[0].ends_with(" FPS)"));
    }
    assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn cancellation_mid_loop_releases_once_and_stops_processing() -> Result<()> {
    let cancel_slot: Arc<Mutex<Option<CancelToken>>> = Arc::new(Mutex::new(None));
    let hook_slot = cancel_slot.clone();
    let detector = StubBackend::new(shape())
        .with_detections(vec![one_box()])
        .on_infer(move |call| {
            if call == 3 {
                if let Some(token) = hook_slot.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
        });
    let calls = detector.call_counter();
    let mut h = harness(1000, detector)?;
    *cancel_slot.lock().unwrap() = Some(h.cancel.clone());

    let summary = h.pipeline.run()?;

    assert_eq!(summary.reason, StopReason::Interrupted);
    assert_eq!(summary.frames_processed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let log = h.log.lock().unwrap();
    assert_eq!(log.frames, vec![1, 2, 3]);
    assert_eq!(log.closes, 1);
    assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn open_failure_is_fatal_and_still_cleans_up() -> Result<()> {
    let log = Arc::new(Mutex::new(Recorded::default()));
    let (tx, _rx) = mpsc::channel();
    let sink = RecordingSink {
        log: log.clone(),
        gate: tx,
    };
    let source = FrameSource::from_spec(
        &SourceSpec::File("/nonexistent/frames".into()),
        SourceOptions::default(),
    );
    assert!(source.is_err());

    let mut pipeline = Pipeline::with_renderer(
        &PipelineConfig::default(),
        FrameSource::new(Box::new(FailingDevice), SourceOptions::default()),
        Box::new(StubBackend::new(shape())),
        Box::new(sink),
        CancelToken::new(),
        Renderer::new(LabelMap::default(), 91, Renderer::embedded_font()?),
    )?;
    let err = pipeline.run().unwrap_err();
    assert!(format!("{:#}", err).contains("no such camera"));
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(log.lock().unwrap().closes, 1);
    assert!(log.lock().unwrap().frames.is_empty());
    Ok(())
}

struct FailingDevice;

impl CaptureDevice for FailingDevice {
    fn describe(&self) -> String {
        "camera 9".to_string()
    }
    fn connect(&mut self) -> Result<()> {
        anyhow::bail!("no such camera")
    }
    fn read(&mut self) -> Result<Option<Frame>> {
        Ok(None)
    }
    fn release(&mut self) {}
}
