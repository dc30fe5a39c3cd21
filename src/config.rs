//! Pipeline configuration: defaults, then a JSON file named by
//! `DETECT_STREAM_CONFIG`, then `DETECT_STREAM_*` environment overrides,
//! then CLI flags. Validated once, immutable afterwards.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::display::StreamConfig;
use crate::ingest::SourceSpec;
use crate::postprocess::PostProcessor;
use crate::preprocess::{InputShape, MAX_FRAME_SIDE};
use crate::render::{LabelMap, DEFAULT_NUM_CLASSES};
use crate::source::SourceOptions;

const DEFAULT_SOURCE: &str = "0";
const DEFAULT_CONFIDENCE: f32 = 0.6;
const DEFAULT_NMS: f32 = 0.6;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    source: Option<String>,
    flip: Option<bool>,
    use_popup: Option<bool>,
    skip_first_frames: Option<u32>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    class_agnostic_nms: Option<bool>,
    target_fps: Option<u32>,
    labels: Option<Vec<String>>,
    labels_path: Option<PathBuf>,
    num_classes: Option<u32>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    max_side: Option<u32>,
    font_path: Option<PathBuf>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    output_path: Option<PathBuf>,
    preview_addr: Option<String>,
    jpeg_quality: Option<u8>,
}

/// Command-line values; `None` keeps the file/env value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub source: Option<String>,
    pub flip: Option<bool>,
    pub use_popup: Option<bool>,
    pub skip_first_frames: Option<u32>,
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: Option<f32>,
    pub nms_threshold: Option<f32>,
    pub preview_addr: Option<String>,
    pub output_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
}

/// Immutable pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: SourceSpec,
    pub flip: bool,
    pub use_popup: bool,
    pub skip_first_frames: u32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub class_agnostic_nms: bool,
    pub target_fps: u32,
    pub labels: Vec<String>,
    pub labels_path: Option<PathBuf>,
    pub num_classes: Option<u32>,
    pub model_path: Option<PathBuf>,
    pub input_width: Option<u32>,
    pub input_height: Option<u32>,
    pub max_side: u32,
    pub font_path: Option<PathBuf>,
    pub stream: StreamConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceSpec::Camera(0),
            flip: false,
            use_popup: false,
            skip_first_frames: 0,
            confidence_threshold: DEFAULT_CONFIDENCE,
            nms_threshold: DEFAULT_NMS,
            class_agnostic_nms: true,
            target_fps: DEFAULT_TARGET_FPS,
            labels: Vec::new(),
            labels_path: None,
            num_classes: None,
            model_path: None,
            input_width: None,
            input_height: None,
            max_side: MAX_FRAME_SIDE,
            font_path: None,
            stream: StreamConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults, then `DETECT_STREAM_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with(CliOverrides::default())
    }

    /// Like `load`, with command-line values applied last.
    pub fn load_with(overrides: CliOverrides) -> Result<Self> {
        let config_path = std::env::var("DETECT_STREAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.apply_overrides(overrides)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let source = SourceSpec::parse(file.source.as_deref().unwrap_or(DEFAULT_SOURCE))?;
        let stream = file.stream.unwrap_or_default();
        Ok(Self {
            source,
            flip: file.flip.unwrap_or(false),
            use_popup: file.use_popup.unwrap_or(false),
            skip_first_frames: file.skip_first_frames.unwrap_or(0),
            confidence_threshold: file.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            nms_threshold: file.nms_threshold.unwrap_or(DEFAULT_NMS),
            class_agnostic_nms: file.class_agnostic_nms.unwrap_or(true),
            target_fps: file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            labels: file.labels.unwrap_or_default(),
            labels_path: file.labels_path,
            num_classes: file.num_classes,
            model_path: file.model_path,
            input_width: file.input_width,
            input_height: file.input_height,
            max_side: file.max_side.unwrap_or(MAX_FRAME_SIDE),
            font_path: file.font_path,
            stream: StreamConfig {
                output_path: stream.output_path,
                preview_addr: stream.preview_addr,
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("DETECT_STREAM_SOURCE") {
            if !source.trim().is_empty() {
                self.source = SourceSpec::parse(&source)?;
            }
        }
        if let Ok(model) = std::env::var("DETECT_STREAM_MODEL") {
            if !model.trim().is_empty() {
                self.model_path = Some(PathBuf::from(model));
            }
        }
        if let Ok(value) = std::env::var("DETECT_STREAM_CONFIDENCE") {
            self.confidence_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_STREAM_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(value) = std::env::var("DETECT_STREAM_NMS") {
            self.nms_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_STREAM_NMS must be a number in [0, 1]"))?;
        }
        if let Ok(addr) = std::env::var("DETECT_STREAM_PREVIEW_ADDR") {
            if !addr.trim().is_empty() {
                self.stream.preview_addr = Some(addr);
            }
        }
        if let Ok(labels) = std::env::var("DETECT_STREAM_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.labels = parsed;
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: CliOverrides) -> Result<()> {
        if let Some(source) = overrides.source {
            self.source = SourceSpec::parse(&source)?;
        }
        if let Some(flip) = overrides.flip {
            self.flip = flip;
        }
        if let Some(use_popup) = overrides.use_popup {
            self.use_popup = use_popup;
        }
        if let Some(skip) = overrides.skip_first_frames {
            self.skip_first_frames = skip;
        }
        if let Some(path) = overrides.model_path {
            self.model_path = Some(path);
        }
        if let Some(threshold) = overrides.confidence_threshold {
            self.confidence_threshold = threshold;
        }
        if let Some(threshold) = overrides.nms_threshold {
            self.nms_threshold = threshold;
        }
        if let Some(addr) = overrides.preview_addr {
            self.stream.preview_addr = Some(addr);
        }
        if let Some(path) = overrides.output_path {
            self.stream.output_path = Some(path);
        }
        if let Some(path) = overrides.labels_path {
            self.labels_path = Some(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.target_fps == 0 {
            return Err(anyhow!("target_fps must be at least 1"));
        }
        if self.max_side == 0 {
            return Err(anyhow!("max_side must be at least 1"));
        }
        if self.input_width == Some(0) || self.input_height == Some(0) {
            return Err(anyhow!("input_width and input_height must be non-zero"));
        }
        if self.input_width.is_some() != self.input_height.is_some() {
            return Err(anyhow!("input_width and input_height must be set together"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!(
                "stream.jpeg_quality must be within 1..=100, got {}",
                self.stream.jpeg_quality
            ));
        }
        if self.num_classes == Some(0) {
            return Err(anyhow!("num_classes must be at least 1"));
        }
        Ok(())
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            flip: self.flip,
            skip_first_frames: self.skip_first_frames,
            target_fps: self.target_fps,
        }
    }

    /// Configured detector input size, if any.
    pub fn input_shape(&self) -> Result<Option<InputShape>> {
        match (self.input_width, self.input_height) {
            (Some(width), Some(height)) => InputShape::new(width, height).map(Some),
            _ => Ok(None),
        }
    }

    /// Labels from `labels_path` when set, otherwise the inline list.
    pub fn label_map(&self) -> Result<LabelMap> {
        match &self.labels_path {
            Some(path) => LabelMap::from_file(path),
            None => Ok(LabelMap::new(self.labels.clone())),
        }
    }

    /// Colour-map denominator for `labels`.
    pub fn num_classes_for(&self, labels: &LabelMap) -> u32 {
        self.num_classes.unwrap_or(if labels.is_empty() {
            DEFAULT_NUM_CLASSES
        } else {
            labels.len() as u32
        })
    }

    pub fn postprocessor(&self) -> Result<PostProcessor> {
        Ok(PostProcessor::new(self.confidence_threshold, self.nms_threshold)?
            .with_class_agnostic(self.class_agnostic_nms))
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
