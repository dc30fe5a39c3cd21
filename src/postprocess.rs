//! Detection post-processing: denormalization and greedy NMS.
//!
//! The score threshold is applied inside the suppression loop rather than as
//! a pre-filter: a candidate is emitted only if it clears the score threshold
//! and does not overlap an already emitted box by more than the NMS
//! threshold. Candidates are visited in descending confidence with a stable
//! sort, so equal confidences keep their raw output order.

use anyhow::{anyhow, Result};

use crate::detect::RawDetection;

/// Default minimum confidence for a kept detection.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.6;
/// Default IoU above which a lower-ranked box is suppressed.
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.6;

/// Axis-aligned box in frame pixels, origin top-left.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PixelBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelBox {
    /// Scale a normalized record to a `frame_width` x `frame_height` frame.
    pub fn from_normalized(raw: &RawDetection, frame_width: u32, frame_height: u32) -> Self {
        let w = frame_width as f32;
        let h = frame_height as f32;
        Self {
            x: raw.xmin * w,
            y: raw.ymin * h,
            width: (raw.xmax - raw.xmin) * w,
            height: (raw.ymax - raw.ymin) * h,
        }
    }

    /// Area, with inverted boxes counting as empty.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union. Zero when the union is empty.
    pub fn iou(&self, other: &PixelBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A kept detection in pixel space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub label: u32,
    pub confidence: f32,
    pub bbox: PixelBox,
}

#[derive(Clone, Debug)]
pub struct PostProcessor {
    score_threshold: f32,
    nms_threshold: f32,
    class_agnostic: bool,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self {
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            class_agnostic: true,
        }
    }
}

impl PostProcessor {
    pub fn new(score_threshold: f32, nms_threshold: f32) -> Result<Self> {
        check_unit("score threshold", score_threshold)?;
        check_unit("nms threshold", nms_threshold)?;
        Ok(Self {
            score_threshold,
            nms_threshold,
            class_agnostic: true,
        })
    }

    /// Suppress only among boxes that share a label when `false`.
    pub fn with_class_agnostic(mut self, class_agnostic: bool) -> Self {
        self.class_agnostic = class_agnostic;
        self
    }

    pub fn score_threshold(&self) -> f32 {
        self.score_threshold
    }

    pub fn nms_threshold(&self) -> f32 {
        self.nms_threshold
    }

    /// Map raw records onto a `frame_width` x `frame_height` frame and run NMS.
    ///
    /// Output is in emit order (highest confidence first). An empty result is
    /// not an error.
    pub fn process(
        &self,
        frame_width: u32,
        frame_height: u32,
        raw: &[RawDetection],
    ) -> Vec<Detection> {
        let candidates: Vec<Detection> = raw
            .iter()
            .map(|record| Detection {
                label: record.label,
                confidence: record.confidence,
                bbox: PixelBox::from_normalized(record, frame_width, frame_height),
            })
            .collect();
        self.suppress(candidates)
    }

    fn suppress(&self, mut candidates: Vec<Detection>) -> Vec<Detection> {
        // sort_by is stable: equal confidences keep their input order.
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut kept: Vec<Detection> = Vec::new();
        for candidate in candidates {
            // NaN confidences fail this comparison and are never kept.
            if !(candidate.confidence >= self.score_threshold) {
                continue;
            }
            let overlaps = kept.iter().any(|emitted| {
                (self.class_agnostic || emitted.label == candidate.label)
                    && emitted.bbox.iou(&candidate.bbox) > self.nms_threshold
            });
            if !overlaps {
                kept.push(candidate);
            }
        }
        kept
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(label: u32, confidence: f32, xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> RawDetection {
        RawDetection::new(label, confidence, xmin, ymin, xmax, ymax)
    }

    /// Deterministic pseudo-random records (xorshift), boxes inside the frame.
    fn scattered(count: usize, seed: u64) -> Vec<RawDetection> {
        let mut state = seed.max(1);
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 10_000) as f32 / 10_000.0
        };
        (0..count)
            .map(|_| {
                let x = next() * 0.8;
                let y = next() * 0.8;
                let w = 0.05 + next() * 0.2;
                let h = 0.05 + next() * 0.2;
                let label = (next() * 5.0) as u32;
                raw(label, next(), x, y, x + w, y + h)
            })
            .collect()
    }

    #[test]
    fn normalized_box_maps_to_pixels() {
        let bbox = PixelBox::from_normalized(&raw(1, 0.9, 0.1, 0.1, 0.5, 0.5), 640, 480);
        assert_eq!(bbox.x, 64.0);
        assert_eq!(bbox.y, 48.0);
        assert_eq!(bbox.width, 256.0);
        assert_eq!(bbox.height, 192.0);
    }

    #[test]
    fn iou_edge_cases() {
        let a = PixelBox {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        let b = PixelBox { x: 5.0, ..a };
        let far = PixelBox { x: 100.0, ..a };
        let empty = PixelBox {
            width: 0.0,
            height: 0.0,
            ..a
        };
        assert_eq!(a.iou(&a), 1.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&far), 0.0);
        assert_eq!(empty.iou(&empty), 0.0);
    }

    #[test]
    fn kept_detections_clear_the_score_threshold() {
        let records = scattered(300, 7);
        for threshold in [0.0, 0.1, 0.35, 0.6, 0.9, 1.0] {
            let post = PostProcessor::new(threshold, DEFAULT_NMS_THRESHOLD).unwrap();
            let kept = post.process(640, 480, &records);
            assert!(kept.iter().all(|d| d.confidence >= threshold), "t={threshold}");
        }
    }

    #[test]
    fn kept_boxes_never_overlap_beyond_nms_threshold() {
        let records = scattered(300, 42);
        let post = PostProcessor::new(0.0, 0.6).unwrap();
        let kept = post.process(640, 480, &records);
        assert!(kept.len() > 1);
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(a.bbox.iou(&b.bbox) <= 0.6);
            }
        }
    }

    #[test]
    fn output_is_sorted_and_deterministic() {
        let records = scattered(200, 99);
        let post = PostProcessor::default();
        let first = post.process(1280, 720, &records);
        let second = post.process(1280, 720, &records);
        assert_eq!(first, second);
        assert!(first
            .windows(2)
            .all(|pair| pair[0].confidence >= pair[1].confidence));
    }

    #[test]
    fn suppression_keeps_highest_confidence() {
        let records = [
            raw(1, 0.7, 0.10, 0.10, 0.50, 0.50),
            raw(1, 0.9, 0.11, 0.11, 0.51, 0.51),
            raw(2, 0.8, 0.60, 0.60, 0.90, 0.90),
        ];
        let kept = PostProcessor::default().process(100, 100, &records);
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8]);
    }

    #[test]
    fn ties_keep_raw_order() {
        let records = [
            raw(3, 0.8, 0.10, 0.10, 0.50, 0.50),
            raw(4, 0.8, 0.10, 0.10, 0.50, 0.50),
        ];
        let kept = PostProcessor::default().process(100, 100, &records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].label, 3);
    }

    #[test]
    fn low_confidence_top_candidate_is_not_emitted() {
        let records = [raw(1, 0.5, 0.1, 0.1, 0.5, 0.5), raw(1, 0.0, 0.0, 0.0, 0.0, 0.0)];
        assert!(PostProcessor::default().process(640, 480, &records).is_empty());
        assert!(PostProcessor::default().process(640, 480, &[]).is_empty());
    }

    #[test]
    fn per_class_suppression_keeps_overlapping_labels() {
        let records = [
            raw(1, 0.9, 0.10, 0.10, 0.50, 0.50),
            raw(2, 0.8, 0.10, 0.10, 0.50, 0.50),
            raw(1, 0.7, 0.10, 0.10, 0.50, 0.50),
        ];
        let agnostic = PostProcessor::default().process(100, 100, &records);
        assert_eq!(agnostic.len(), 1);
        let per_class = PostProcessor::default()
            .with_class_agnostic(false)
            .process(100, 100, &records);
        let labels: Vec<u32> = per_class.iter().map(|d| d.label).collect();
        assert_eq!(labels, vec![1, 2]);
    }

    #[test]
    fn nan_confidence_is_dropped() {
        let records = [raw(1, f32::NAN, 0.1, 0.1, 0.5, 0.5)];
        assert!(PostProcessor::new(0.0, 0.5)
            .unwrap()
            .process(10, 10, &records)
            .is_empty());
    }

    #[test]
    fn thresholds_are_validated() {
        assert!(PostProcessor::new(1.5, 0.5).is_err());
        assert!(PostProcessor::new(0.5, -0.1).is_err());
        assert!(PostProcessor::new(f32::NAN, 0.5).is_err());
    }
}
