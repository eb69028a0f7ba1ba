//! Object detection postprocessing: decode, inverse letterbox and NMS

use crate::config::{ObjectConfig, OutputLayout};
use crate::error::VisionError;
use crate::models::LabelTable;
use crate::tensor::LetterboxTransform;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Box attributes preceding the class scores in each prediction
const BOX_ATTRIBUTES: usize = 4;

/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    /// Intersection over union; 0.0 for disjoint, degenerate or non-finite boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let coords = [
            self.left, self.top, self.right, self.bottom,
            other.left, other.top, other.right, other.bottom,
        ];
        if coords.iter().any(|v| !v.is_finite()) {
            return 0.0;
        }

        let inter_left = self.left.max(other.left);
        let inter_top = self.top.max(other.top);
        let inter_right = self.right.min(other.right);
        let inter_bottom = self.bottom.min(other.bottom);

        if inter_right <= inter_left || inter_bottom <= inter_top {
            return 0.0;
        }

        let inter_area = (inter_right - inter_left) * (inter_bottom - inter_top);
        let union_area = self.area() + other.area() - inter_area;
        if union_area <= 0.0 || !union_area.is_finite() {
            return 0.0;
        }

        (inter_area / union_area).clamp(0.0, 1.0)
    }
}

/// Detected object in original-frame coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Greedy non-maximum suppression.
///
/// Candidates are stably sorted by confidence (descending) and a box is kept
/// only if its IoU with every already-kept box is `<= iou_threshold`. On equal
/// confidence the earlier candidate wins. At most `max_keep` boxes survive.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_keep: usize,
) -> Vec<Detection> {
    candidates.retain(|d| d.confidence.is_finite());
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(candidates.len().min(max_keep));
    for candidate in candidates {
        if keep.len() >= max_keep {
            break;
        }
        if keep.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Turns raw detector output into deduplicated frame-space detections.
#[derive(Debug, Clone)]
pub struct DetectionPostprocessor {
    labels: LabelTable,
    confidence_threshold: f32,
    nms_threshold: f32,
    max_detections: usize,
    layout: OutputLayout,
}

impl DetectionPostprocessor {
    pub fn new(labels: LabelTable, config: &ObjectConfig) -> Self {
        Self {
            labels,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
            max_detections: config.max_detections,
            layout: config.output_layout,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Decode `raw`, logging and returning an empty list on malformed output.
    pub fn postprocess(&self, raw: &[f32], transform: &LetterboxTransform) -> Vec<Detection> {
        match self.try_postprocess(raw, transform) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("Discarding detector output: {}", e);
                Vec::new()
            }
        }
    }

    pub fn try_postprocess(
        &self,
        raw: &[f32],
        transform: &LetterboxTransform,
    ) -> Result<Vec<Detection>, VisionError> {
        let stride = BOX_ATTRIBUTES + self.num_classes();
        if self.num_classes() == 0 || raw.is_empty() || raw.len() % stride != 0 {
            return Err(VisionError::MalformedOutput {
                expected: format!("a multiple of {} (4 + {} classes)", stride, self.num_classes()),
                actual: raw.len(),
            });
        }
        if !transform.scale.is_finite() || transform.scale <= 0.0 {
            return Err(VisionError::InvalidFrame(format!(
                "letterbox scale {} is not usable",
                transform.scale
            )));
        }

        let num_predictions = raw.len() / stride;
        let attribute = |prediction: usize, index: usize| -> f32 {
            match self.layout {
                OutputLayout::PredictionMajor => raw[prediction * stride + index],
                OutputLayout::AttributeMajor => raw[index * num_predictions + prediction],
            }
        };

        let mut candidates = Vec::new();
        for i in 0..num_predictions {
            let mut class_id = 0usize;
            let mut confidence = f32::NEG_INFINITY;
            for c in 0..self.num_classes() {
                let score = attribute(i, BOX_ATTRIBUTES + c);
                if score > confidence {
                    confidence = score;
                    class_id = c;
                }
            }

            if !confidence.is_finite() || confidence < self.confidence_threshold {
                continue;
            }

            let cx = attribute(i, 0);
            let cy = attribute(i, 1);
            let w = attribute(i, 2);
            let h = attribute(i, 3);
            if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
                continue;
            }

            let (left, top) = transform.to_frame(cx - w / 2.0, cy - h / 2.0);
            let (right, bottom) = transform.to_frame(cx + w / 2.0, cy + h / 2.0);
            if right <= left || bottom <= top {
                continue;
            }

            candidates.push(Detection {
                class_id,
                label: self.labels.label(class_id),
                confidence: confidence.min(1.0),
                bbox: BoundingBox::new(left, top, right, bottom),
            });
        }

        let candidate_count = candidates.len();
        let kept = non_max_suppression(candidates, self.nms_threshold, self.max_detections);
        debug!(
            "Decoded {} predictions: {} above threshold, {} after NMS",
            num_predictions,
            candidate_count,
            kept.len()
        );
        Ok(kept)
    }
}
