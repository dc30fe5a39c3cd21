//! Detection overlay rendering.
//!
//! Rendering happens in two steps. `Renderer::plan` turns detections and the
//! current inference estimate into an `OverlayPlan` of boxes and text items;
//! `Renderer::draw` rasterises a plan onto a frame with `imageproc`. Boxes
//! are clipped to the frame before drawing, so boxes that are empty, inverted
//! or partly outside the frame never fail.
//!
//! Text positions are baselines (the glyph bottom-left), matching the usual
//! convention of computer-vision overlay code.

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::perf::PerfEstimate;
use crate::postprocess::Detection;

pub const BOX_THICKNESS: u32 = 3;
/// Label baseline offset from the box's top-left corner.
pub const LABEL_OFFSET: (i32, i32) = (10, 30);
/// Baseline of the inference-time overlay.
pub const OVERLAY_ORIGIN: (i32, i32) = (20, 40);
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([255, 64, 16]);
/// Glyph height in pixels at font scale 1.0.
pub const GLYPH_PX_AT_UNIT_SCALE: f32 = 30.0;
/// Colour-map denominator when no label list is configured (COCO ids).
pub const DEFAULT_NUM_CLASSES: u32 = 91;

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Text starting further left or above the frame than this is skipped.
const TEXT_MARGIN: i32 = 1 << 16;

/// Used when no system font is found, so text is always drawn.
const EMBEDDED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Class names indexed by detector label id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// One name per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read label file {}", path.display()))?;
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect(),
        ))
    }

    /// Name for `label`, or `class <label>` when unknown.
    pub fn name(&self, label: u32) -> Cow<'_, str> {
        match self.names.get(label as usize) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(format!("class {}", label)),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Rainbow colour for `label / num_classes`, hue 0° (red) to 300° (magenta).
pub fn rainbow(label: u32, num_classes: u32) -> Rgb<u8> {
    let position = if num_classes == 0 {
        0.0
    } else {
        (label as f32 / num_classes as f32).clamp(0.0, 1.0)
    };
    hue_to_rgb(position * 300.0)
}

fn hue_to_rgb(hue: f32) -> Rgb<u8> {
    let sector = hue / 60.0;
    let x = 1.0 - (sector % 2.0 - 1.0).abs();
    let (r, g, b) = match sector as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let channel = |v: f32| (v * 255.0).round() as u8;
    Rgb([channel(r), channel(g), channel(b)])
}

/// One drawing primitive.
#[derive(Clone, Debug, PartialEq)]
pub enum OverlayItem {
    Rect {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        color: Rgb<u8>,
        thickness: u32,
    },
    Text {
        x: i32,
        y: i32,
        text: String,
        scale: f32,
        color: Rgb<u8>,
    },
}

/// Everything drawn on one frame, in drawing order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlayPlan {
    pub items: Vec<OverlayItem>,
}

impl OverlayPlan {
    pub fn rect_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, OverlayItem::Rect { .. }))
            .count()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|item| match item {
            OverlayItem::Text { text, .. } => Some(text.as_str()),
            OverlayItem::Rect { .. } => None,
        })
    }
}

pub struct Renderer {
    labels: LabelMap,
    num_classes: u32,
    font: FontArc,
}

impl Renderer {
    pub fn new(labels: LabelMap, num_classes: u32, font: FontArc) -> Self {
        Self {
            labels,
            num_classes,
            font,
        }
    }

    /// The DejaVu Sans copy bundled with the crate.
    pub fn embedded_font() -> Result<FontArc> {
        FontArc::try_from_slice(EMBEDDED_FONT).context("parse embedded font")
    }

    /// Load `path`, or probe common system font locations when `None`.
    ///
    /// An explicit path that cannot be loaded is an error. When probing finds
    /// nothing usable the embedded font is used.
    pub fn load_font(path: Option<&Path>) -> Result<FontArc> {
        if let Some(path) = path {
            return read_font(path);
        }
        for candidate in FONT_CANDIDATES {
            let candidate = PathBuf::from(candidate);
            if !candidate.is_file() {
                continue;
            }
            match read_font(&candidate) {
                Ok(font) => {
                    log::debug!("Renderer: using font {}", candidate.display());
                    return Ok(font);
                }
                Err(err) => log::debug!("Renderer: skipping font: {:#}", err),
            }
        }
        log::debug!("Renderer: no system font found, using embedded DejaVu Sans");
        Self::embedded_font()
    }

    /// Build the overlay for one frame.
    pub fn plan(
        &self,
        frame_width: u32,
        detections: &[Detection],
        estimate: Option<&PerfEstimate>,
    ) -> OverlayPlan {
        let scale = frame_width as f32 / 1000.0;
        let mut items = Vec::with_capacity(detections.len() * 2 + 1);
        for detection in detections {
            let color = rainbow(detection.label, self.num_classes);
            let x = saturate(detection.bbox.x);
            let y = saturate(detection.bbox.y);
            items.push(OverlayItem::Rect {
                x,
                y,
                width: saturate_len(detection.bbox.width),
                height: saturate_len(detection.bbox.height),
                color,
                thickness: BOX_THICKNESS,
            });
            items.push(OverlayItem::Text {
                x: x.saturating_add(LABEL_OFFSET.0),
                y: y.saturating_add(LABEL_OFFSET.1),
                text: format!(
                    "{} {:.2}",
                    self.labels.name(detection.label),
                    detection.confidence
                ),
                scale,
                color,
            });
        }
        if let Some(estimate) = estimate {
            items.push(OverlayItem::Text {
                x: OVERLAY_ORIGIN.0,
                y: OVERLAY_ORIGIN.1,
                text: estimate.overlay_text(),
                scale,
                color: OVERLAY_COLOR,
            });
        }
        OverlayPlan { items }
    }

    /// Rasterise `plan` onto `image`.
    pub fn draw(&self, image: &mut RgbImage, plan: &OverlayPlan) {
        for item in &plan.items {
            match item {
                OverlayItem::Rect {
                    x,
                    y,
                    width,
                    height,
                    color,
                    thickness,
                } => draw_box(image, *x, *y, *width, *height, *color, *thickness),
                OverlayItem::Text {
                    x,
                    y,
                    text,
                    scale,
                    color,
                } => {
                    let px = (GLYPH_PX_AT_UNIT_SCALE * scale).max(1.0);
                    let top = y.saturating_sub(px.round() as i32);
                    let on_canvas = (-TEXT_MARGIN..image.width() as i32).contains(x)
                        && (-TEXT_MARGIN..image.height() as i32).contains(&top);
                    if on_canvas {
                        draw_text_mut(image, *color, *x, top, PxScale::from(px), &self.font, text);
                    }
                }
            }
        }
    }

    /// Plan and draw in one go, returning the plan.
    pub fn render(
        &self,
        frame: &mut Frame,
        detections: &[Detection],
        estimate: Option<&PerfEstimate>,
    ) -> OverlayPlan {
        let plan = self.plan(frame.width(), detections, estimate);
        self.draw(frame.image_mut(), &plan);
        plan
    }
}

fn read_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
    FontArc::try_from_vec(bytes).with_context(|| format!("parse font {}", path.display()))
}

fn saturate(value: f32) -> i32 {
    // `as` saturates and maps NaN to zero.
    value.round() as i32
}

fn saturate_len(value: f32) -> u32 {
    value.round().max(0.0) as u32
}

/// Hollow box of `thickness` nested one-pixel outlines, inset from the
/// outer edge, clipped to a margin around the image.
fn draw_box(
    image: &mut RgbImage,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    color: Rgb<u8>,
    thickness: u32,
) {
    let margin = thickness as i64 + 1;
    let left = (x as i64).max(-margin);
    let top = (y as i64).max(-margin);
    let right = (x as i64 + width as i64).min(image.width() as i64 + margin);
    let bottom = (y as i64 + height as i64).min(image.height() as i64 + margin);
    for inset in 0..thickness as i64 {
        let w = right - left - 2 * inset;
        let h = bottom - top - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect =
            Rect::at((left + inset) as i32, (top + inset) as i32).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}
