//! Background capture with a single-slot handoff.
//!
//! `FrameSource` owns a capture thread that reads from a `CaptureDevice` as
//! fast as the device allows and writes each frame into a one-frame slot,
//! overwriting (and counting) any frame the consumer has not taken yet. The
//! consumer therefore always gets the freshest frame and never a backlog.
//!
//! The slot is a `Mutex<Slot>` + `Condvar`; a frame is moved in and out whole
//! under the lock, so a reader sees either the previous or the next complete
//! frame.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::frame::Frame;
use crate::ingest::{open_device, CaptureDevice, SourceSpec};

/// Per-source capture options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceOptions {
    /// Mirror every frame horizontally before it becomes visible.
    pub flip: bool,
    /// Frames discarded right after start (auto-exposure settling).
    pub skip_first_frames: u32,
    /// Frame rate requested from camera drivers and used to pace files and
    /// stubs. Zero keeps the driver's rate and leaves other sources unpaced.
    pub target_fps: u32,
}

/// Counters for the capture side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Frames published to the slot (after warm-up skipping).
    pub frames_captured: u64,
    /// Frames overwritten before the consumer took them.
    pub frames_dropped: u64,
    /// Frames handed to the consumer.
    pub frames_delivered: u64,
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    ended: bool,
    stats: SourceStats,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic on the capture thread must not take the consumer down with it.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, frame: Frame) {
        let mut slot = self.lock();
        if slot.frame.replace(frame).is_some() {
            slot.stats.frames_dropped += 1;
        }
        slot.stats.frames_captured += 1;
        drop(slot);
        self.ready.notify_one();
    }

    fn finish(&self) {
        self.lock().ended = true;
        self.ready.notify_all();
    }
}

/// Marks the stream ended when the capture thread exits, even by panic.
struct EndOfStream(Arc<Shared>);

impl Drop for EndOfStream {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Releases the device when the capture thread exits, even by panic.
struct ReleaseOnDrop(Box<dyn CaptureDevice>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

enum State {
    /// Built, device not opened yet.
    Pending(Box<dyn CaptureDevice>),
    /// Capture thread running (or finished but not joined).
    Running(JoinHandle<()>),
    /// Stopped, or start failed.
    Stopped,
}

/// Frame producer with drop-oldest, single-slot buffering.
pub struct FrameSource {
    target: String,
    options: SourceOptions,
    shared: Arc<Shared>,
    state: State,
}

impl FrameSource {
    pub fn new(device: Box<dyn CaptureDevice>, options: SourceOptions) -> Self {
        Self {
            target: device.describe(),
            options,
            shared: Arc::new(Shared::default()),
            state: State::Pending(device),
        }
    }

    /// Build the device for `spec` without opening it.
    pub fn from_spec(spec: &SourceSpec, options: SourceOptions) -> Result<Self> {
        Ok(Self::new(open_device(spec, options.target_fps)?, options))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Open the device and start the capture thread.
    ///
    /// Open failures are returned here and are fatal; the device is released
    /// before returning.
    pub fn start(&mut self) -> Result<()> {
        let device = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Pending(device) => device,
            other => {
                self.state = other;
                return Err(anyhow!("frame source {} already started", self.target));
            }
        };

        let mut device = ReleaseOnDrop(device);
        device.0.connect()?;

        let shared = self.shared.clone();
        let options = self.options;
        let target = self.target.clone();
        let join = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(device, shared, options, target))?;
        self.state = State::Running(join);
        log::info!("FrameSource: capturing from {}", self.target);
        Ok(())
    }

    /// Block until a fresh frame is available.
    ///
    /// Returns `Ok(None)` once the stream has ended (finite source exhausted,
    /// decode failure, device failure or `stop`). Every frame is returned at
    /// most once.
    pub fn next(&mut self) -> Result<Option<Frame>> {
        if let State::Pending(_) = self.state {
            return Err(anyhow!("frame source {} not started", self.target));
        }
        let mut slot = self.shared.lock();
        loop {
            if let Some(frame) = slot.frame.take() {
                slot.stats.frames_delivered += 1;
                return Ok(Some(frame));
            }
            if slot.ended {
                return Ok(None);
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Stop capture, release the device and join the capture thread.
    ///
    /// Idempotent; safe before `start` and after a failed `start`.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(join) => {
                if join.join().is_err() {
                    log::error!("FrameSource: capture thread for {} panicked", self.target);
                }
                log::info!("FrameSource: released {}", self.target);
            }
            State::Pending(_) | State::Stopped => {}
        }
        // Unblock any consumer still waiting on the slot.
        self.shared.finish();
    }

    pub fn stats(&self) -> SourceStats {
        self.shared.lock().stats
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut device: ReleaseOnDrop,
    shared: Arc<Shared>,
    options: SourceOptions,
    target: String,
) {
    // Declared first so it drops last: the device is released before the
    // consumer can observe end of stream.
    let _end = EndOfStream(shared.clone());
    let mut skipped = 0u32;

    while !shared.stop.load(Ordering::SeqCst) {
        match device.0.read() {
            Ok(Some(mut frame)) => {
                if skipped < options.skip_first_frames {
                    skipped += 1;
                    log::debug!(
                        "FrameSource: skipped warm-up frame {}/{}",
                        skipped,
                        options.skip_first_frames
                    );
                    continue;
                }
                if options.flip {
                    frame.flip_horizontal();
                }
                shared.publish(frame);
            }
            Ok(None) => {
                log::info!("FrameSource: {} exhausted", target);
                break;
            }
            Err(err) => {
                log::warn!("FrameSource: capture from {} failed: {:#}", target, err);
                break;
            }
        }
    }
    drop(device);
}
