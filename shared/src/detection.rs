use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::BoxFormat;
use crate::vision::VisionError;

/// Number of leading box features (`cx, cy, w, h`) in each candidate row.
pub const BOX_FEATURES: usize = 4;

/// Upper bound on anchors accepted from a model output.
pub const MAX_MODEL_ANCHORS: usize = 50_000;

/// Boxes thinner than this (in original-image pixels) after clamping are dropped.
const MIN_BOX_SIDE: f32 = 1e-3;

// ============================================================================
// Geometry
// ============================================================================

/// Axis-aligned box in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    #[must_use]
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            left: cx - w / 2.0,
            top: cy - h / 2.0,
            right: cx + w / 2.0,
            bottom: cy + h / 2.0,
        }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    #[must_use]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.left.is_finite() && self.top.is_finite() && self.right.is_finite() && self.bottom.is_finite()
    }

    #[must_use]
    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        Self {
            left: self.left.clamp(0.0, width),
            top: self.top.clamp(0.0, height),
            right: self.right.clamp(0.0, width),
            bottom: self.bottom.clamp(0.0, height),
        }
    }

    #[must_use]
    pub fn intersection_area(&self, other: &Self) -> f32 {
        let inter_w = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let inter_h = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        inter_w * inter_h
    }

    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        iou(self, other)
    }
}

/// Intersection over union. Zero when the union area is not positive.
#[must_use]
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter = a.intersection_area(b);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

// ============================================================================
// Detection Result
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Label from the model's label file; the join key into the nutrition table.
    pub label: String,
    pub class_id: usize,
    /// Detection confidence score (0.0..1.0)
    pub confidence: f32,
}

/// Metadata about the detection run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct DetectionResult {
    /// Highest confidence first.
    pub detections: Vec<Detection>,
    /// True if NMS input was truncated
    pub truncated: bool,
    /// Number of candidates before NMS
    pub candidates_before_nms: usize,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

impl DetectionResult {
    /// The detector ran and found nothing above threshold.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[must_use]
    pub fn top(&self) -> Option<&Detection> {
        self.detections.first()
    }
}

// ============================================================================
// Raw output normalisation
// ============================================================================

/// Owned copy of a model output tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawTensor {
    #[must_use]
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// Reshapes a model output into `[anchors, 4 + classes]`.
///
/// Accepts `[1, F, N]` (feature-major, transposed explicitly), `[1, N, F]`, or the same
/// without the batch axis. When both axes equal `F`, the feature-major layout wins.
pub fn to_candidate_rows(raw: &RawTensor, num_features: usize) -> Result<Array2<f32>, VisionError> {
    let dims: &[usize] = match raw.shape.as_slice() {
        [1, _, _] => &raw.shape[1..],
        [a, b] if *a > 0 && *b > 0 => &raw.shape[..],
        _ => {
            return Err(VisionError::InvalidOutputShape {
                expected: "[1, features, anchors] or [1, anchors, features]".into(),
                got: format!("{:?}", raw.shape),
            })
        }
    };

    let expected_len = dims[0].checked_mul(dims[1]).unwrap_or(usize::MAX);
    if raw.data.len() != expected_len {
        return Err(VisionError::InvalidOutputShape {
            expected: format!("{expected_len} elements for shape {:?}", raw.shape),
            got: format!("{} elements", raw.data.len()),
        });
    }

    if dims[0] == num_features {
        let num_anchors = dims[1];
        check_anchor_count(num_anchors)?;
        let features_major = Array2::from_shape_vec((num_features, num_anchors), raw.data.clone())
            .map_err(|e| VisionError::Processing(e.to_string()))?;
        Ok(features_major.t().as_standard_layout().into_owned())
    } else if dims[1] == num_features {
        let num_anchors = dims[0];
        check_anchor_count(num_anchors)?;
        Array2::from_shape_vec((num_anchors, num_features), raw.data.clone())
            .map_err(|e| VisionError::Processing(e.to_string()))
    } else {
        Err(VisionError::ModelMismatch(format!(
            "output shape {:?} has no axis of {} features ({} labels + 4 box values)",
            raw.shape,
            num_features,
            num_features.saturating_sub(BOX_FEATURES)
        )))
    }
}

fn check_anchor_count(num_anchors: usize) -> Result<(), VisionError> {
    if num_anchors > MAX_MODEL_ANCHORS {
        return Err(VisionError::InvalidOutputShape {
            expected: format!("at most {MAX_MODEL_ANCHORS} anchors"),
            got: format!("{num_anchors} anchors"),
        });
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
    pub input_width: u32,
    pub input_height: u32,
    pub orig_width: u32,
    pub orig_height: u32,
    pub score_threshold: f32,
    pub box_format: BoxFormat,
}

/// Turns candidate rows into detections in original-image pixels.
///
/// Rows whose best class score is non-finite or below the threshold are skipped, as are
/// rows with non-finite or non-positive box sizes.
pub fn decode_candidates(
    rows: ArrayView2<'_, f32>,
    labels: &[String],
    params: &DecodeParams,
) -> Result<Vec<Detection>, VisionError> {
    let num_features = BOX_FEATURES + labels.len();
    if rows.ncols() != num_features {
        return Err(VisionError::ModelMismatch(format!(
            "expected {num_features} features per candidate, got {}",
            rows.ncols()
        )));
    }
    if params.input_width == 0 || params.input_height == 0 {
        return Err(VisionError::Processing("model input size is zero".into()));
    }

    let input_w = params.input_width as f32;
    let input_h = params.input_height as f32;
    let orig_w = params.orig_width as f32;
    let orig_h = params.orig_height as f32;

    // model-input pixels -> original pixels
    let scale_x = orig_w / input_w;
    let scale_y = orig_h / input_h;

    let (unit_x, unit_y) = match params.box_format {
        BoxFormat::Normalized => (input_w, input_h),
        BoxFormat::Pixels => (1.0, 1.0),
    };

    let mut candidates = Vec::new();

    for row in rows.rows() {
        let (best_cls_idx, max_score) = row
            .iter()
            .skip(BOX_FEATURES)
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |(best_idx, best_score), (idx, &score)| {
                if score > best_score {
                    (idx, score)
                } else {
                    (best_idx, best_score)
                }
            });

        if !max_score.is_finite() || max_score < params.score_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        if !cx.is_finite() || !cy.is_finite() || !w.is_finite() || !h.is_finite() {
            continue;
        }
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        let model_space = BoundingBox::from_center(cx * unit_x, cy * unit_y, w * unit_x, h * unit_y);
        let bbox = BoundingBox::new(
            model_space.left * scale_x,
            model_space.top * scale_y,
            model_space.right * scale_x,
            model_space.bottom * scale_y,
        )
        .clamp_to(orig_w, orig_h);

        if !bbox.is_finite() || bbox.width() < MIN_BOX_SIDE || bbox.height() < MIN_BOX_SIDE {
            continue;
        }

        candidates.push(Detection {
            bbox,
            label: labels[best_cls_idx].clone(),
            class_id: best_cls_idx,
            confidence: max_score.min(1.0),
        });
    }

    Ok(candidates)
}

// ============================================================================
// NMS Implementation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsParams {
    pub iou_threshold: f32,
    pub max_results: usize,
    pub max_candidates: usize,
}

/// Greedy, class-agnostic non-maximum suppression.
///
/// Returns (kept_detections, was_truncated). Kept detections are in descending
/// confidence order; equal confidences keep their input order.
pub fn non_max_suppression(mut candidates: Vec<Detection>, params: &NmsParams) -> (Vec<Detection>, bool) {
    if candidates.is_empty() || params.max_results == 0 {
        return (Vec::new(), false);
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let truncated = candidates.len() > params.max_candidates;
    if truncated {
        warn!(
            original = candidates.len(),
            limit = params.max_candidates,
            "NMS input truncated"
        );
        candidates.truncate(params.max_candidates);
    }

    let mut kept: Vec<Detection> = Vec::with_capacity(params.max_results.min(candidates.len()));

    for candidate in candidates {
        if kept.len() >= params.max_results {
            break;
        }
        let overlaps = kept
            .iter()
            .any(|k| k.bbox.iou(&candidate.bbox) > params.iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }

    (kept, truncated)
}

/// Full postprocessing: layout normalisation, decoding, then NMS.
///
/// Returns (detections, was_truncated, candidates_before_nms).
#[instrument(skip(raw, labels), fields(shape = ?raw.shape, labels = labels.len()))]
pub fn postprocess(
    raw: &RawTensor,
    labels: &[String],
    decode: &DecodeParams,
    nms: &NmsParams,
) -> Result<(Vec<Detection>, bool, usize), VisionError> {
    let rows = to_candidate_rows(raw, BOX_FEATURES + labels.len())?;
    let candidates = decode_candidates(rows.view(), labels, decode)?;
    let candidates_before_nms = candidates.len();
    let (detections, truncated) = non_max_suppression(candidates, nms);

    debug!(
        candidates_before_nms,
        kept = detections.len(),
        truncated,
        "postprocess finished"
    );

    Ok((detections, truncated, candidates_before_nms))
}

// ============================================================================
// Tests
// ============================================================================
