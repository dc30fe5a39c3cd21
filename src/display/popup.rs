#![cfg(feature = "popup-minifb")]

//! Popup window output backed by `minifb`. Escape or closing the window
//! reads as the exit key.

use anyhow::{anyhow, Result};
use minifb::{Key, Window, WindowOptions};
use std::time::Duration;

use super::{OutputSink, KEY_ESCAPE};
use crate::frame::Frame;
use crate::perf::PerfEstimate;
use crate::render::OverlayPlan;

/// Popup window. Created on the first frame and recreated when the frame
/// size changes.
pub struct PopupSink {
    title: String,
    window: Option<Window>,
    buffer: Vec<u32>,
    size: (usize, usize),
}

impl PopupSink {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            window: None,
            buffer: Vec::new(),
            size: (0, 0),
        }
    }

    fn window_for(&mut self, width: usize, height: usize) -> Result<&mut Window> {
        if self.window.is_none() || self.size != (width, height) {
            let window = Window::new(&self.title, width, height, WindowOptions::default())
                .map_err(|err| anyhow!("open popup window: {}", err))?;
            self.window = Some(window);
            self.size = (width, height);
            self.buffer = vec![0u32; width * height];
            log::info!("PopupSink: opened {}x{} window", width, height);
        }
        self.window
            .as_mut()
            .ok_or_else(|| anyhow!("popup window missing"))
    }
}

impl OutputSink for PopupSink {
    fn name(&self) -> &'static str {
        "popup"
    }

    fn emit(
        &mut self,
        frame: &Frame,
        _plan: &OverlayPlan,
        _estimate: Option<&PerfEstimate>,
    ) -> Result<()> {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        self.window_for(width, height)?;
        for (dst, px) in self.buffer.iter_mut().zip(frame.image().pixels()) {
            let [r, g, b] = px.0;
            *dst = (r as u32) << 16 | (g as u32) << 8 | b as u32;
        }
        let window = self
            .window
            .as_mut()
            .ok_or_else(|| anyhow!("popup window missing"))?;
        window
            .update_with_buffer(&self.buffer, width, height)
            .map_err(|err| anyhow!("update popup window: {}", err))
    }

    fn is_interactive(&self) -> bool {
        true
    }

    /// A closed window reports ESC.
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<u32>> {
        let Some(window) = self.window.as_mut() else {
            return Ok(None);
        };
        std::thread::sleep(timeout);
        window.update();
        if !window.is_open() || window.is_key_down(Key::Escape) {
            return Ok(Some(KEY_ESCAPE));
        }
        Ok(None)
    }

    fn close(&mut self) {
        if self.window.take().is_some() {
            log::info!("PopupSink: window closed");
        }
    }
}
