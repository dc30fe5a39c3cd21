//! Rolling inference-time statistics.

use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept by the default meter.
pub const WINDOW_CAPACITY: usize = 200;

/// Fixed-capacity FIFO; pushing past capacity evicts the oldest entry.
#[derive(Clone, Debug)]
pub struct RollingWindow<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `value`, returning the evicted entry if the window was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        self.values.push_back(value);
        if self.values.len() > self.capacity {
            self.values.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerfEstimate {
    pub mean_ms: f64,
    pub fps: f64,
}

impl PerfEstimate {
    /// Overlay text, e.g. `Inference time: 12.3ms (81.3 FPS)`.
    pub fn overlay_text(&self) -> String {
        format!("Inference time: {:.1}ms ({:.1} FPS)", self.mean_ms, self.fps)
    }
}

#[derive(Clone, Debug)]
pub struct PerfMeter {
    window: RollingWindow<Duration>,
    recorded: u64,
}

impl Default for PerfMeter {
    fn default() -> Self {
        Self::new(WINDOW_CAPACITY)
    }
}

impl PerfMeter {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RollingWindow::new(capacity),
            recorded: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.window.push(elapsed);
        self.recorded += 1;
    }

    /// Mean of the window; `None` before the first `record`.
    ///
    /// A zero mean reports infinite FPS.
    pub fn estimate(&self) -> Option<PerfEstimate> {
        if self.window.is_empty() {
            return None;
        }
        let total: f64 = self.window.iter().map(Duration::as_secs_f64).sum();
        let mean_ms = total / self.window.len() as f64 * 1000.0;
        let fps = if mean_ms > 0.0 {
            1000.0 / mean_ms
        } else {
            f64::INFINITY
        };
        Some(PerfEstimate { mean_ms, fps })
    }

    /// Samples currently in the window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Samples recorded since creation.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }
}
