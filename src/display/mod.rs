//! Display collaborators for annotated frames.
//!
//! Two kinds of sink exist: a popup window that can be polled for key
//! presses, and a streaming sink that JPEG-encodes each frame and replaces
//! whatever it showed before (a file on disk and/or the preview server).

#[cfg(feature = "popup-minifb")]
mod popup;
mod server;
mod stream;

use anyhow::Result;
use std::time::Duration;

use crate::frame::Frame;
use crate::perf::PerfEstimate;
use crate::render::OverlayPlan;

#[cfg(feature = "popup-minifb")]
pub use popup::PopupSink;
pub use server::{PreviewHandle, PreviewServer};
pub use stream::{encode_jpeg, PreviewSlot, PreviewStats, StreamConfig, StreamSink};

/// Key code reported for ESC.
pub const KEY_ESCAPE: u32 = 27;
/// Wait used when polling a popup for key presses.
pub const KEY_POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub trait OutputSink {
    fn name(&self) -> &'static str;

    /// Show one annotated frame. `plan` is what was drawn on it.
    fn emit(
        &mut self,
        frame: &Frame,
        plan: &OverlayPlan,
        estimate: Option<&PerfEstimate>,
    ) -> Result<()>;

    /// Windowed sinks return `true` and are polled for keys after each emit.
    fn is_interactive(&self) -> bool {
        false
    }

    /// Wait up to `timeout` for a key press.
    fn poll_key(&mut self, _timeout: Duration) -> Result<Option<u32>> {
        Ok(None)
    }

    /// Release window or stream resources. Must be idempotent.
    fn close(&mut self) {}
}
