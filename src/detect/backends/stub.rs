use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::detect::backend::{check_input, DetectorBackend};
use crate::detect::result::RawDetection;
use crate::preprocess::{InputShape, InputTensor};

type InferHook = Box<dyn FnMut(u64) + Send>;

/// Scripted backend for tests and model-less runs.
///
/// Replays a fixed list of per-call outputs, cycling when the script runs
/// out. An empty script yields no detections. Output is padded with
/// zero-confidence rows the way a fixed-N detector pads its output.
pub struct StubBackend {
    shape: InputShape,
    script: Vec<Vec<RawDetection>>,
    padding: usize,
    calls: Arc<AtomicU64>,
    hook: Option<InferHook>,
}

impl StubBackend {
    pub fn new(shape: InputShape) -> Self {
        Self {
            shape,
            script: Vec::new(),
            padding: 0,
            calls: Arc::new(AtomicU64::new(0)),
            hook: None,
        }
    }

    /// Return the same detections on every call.
    pub fn with_detections(mut self, detections: Vec<RawDetection>) -> Self {
        self.script = vec![detections];
        self
    }

    /// Return `script[n % len]` on call `n`.
    pub fn with_script(mut self, script: Vec<Vec<RawDetection>>) -> Self {
        self.script = script;
        self
    }

    /// Pad every output to at least `rows` records.
    pub fn with_padding(mut self, rows: usize) -> Self {
        self.padding = rows;
        self
    }

    /// Run `hook(call_number)` after each successful call (1-based).
    pub fn on_infer(mut self, hook: impl FnMut(u64) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Shared call counter, readable after the backend is moved away.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn infer(&mut self, input: &InputTensor) -> Result<Vec<RawDetection>> {
        check_input(self.shape, input)?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut output = if self.script.is_empty() {
            Vec::new()
        } else {
            self.script[(call as usize) % self.script.len()].clone()
        };
        if output.len() < self.padding {
            output.resize(self.padding, RawDetection::default());
        }
        if let Some(hook) = self.hook.as_mut() {
            hook(call + 1);
        }
        Ok(output)
    }
}
