use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use image::{DynamicImage, RgbImage};
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::DetectorConfig;
use crate::detection::{self, DecodeParams, DetectionResult, NmsParams, RawTensor};
use crate::imaging::{self, ImageLimits, ImagingError};

// ============================================================================
// Error Types (sanitized for external consumption)
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum VisionError {
    #[error("detector is not ready (state: {state})")]
    NotReady { state: String },

    #[error("detector has been closed")]
    Closed,

    #[error(transparent)]
    Imaging(#[from] ImagingError),

    #[error("invalid frame: {width}x{height} with {len} bytes")]
    InvalidFrame { width: u32, height: u32, len: usize },

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("failed to load labels: {0}")]
    Labels(String),

    #[error("inference engine error")]
    InferenceEngine(String), // Sanitized - no raw ORT errors

    #[error("invalid model output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    #[error("model configuration mismatch: {0}")]
    ModelMismatch(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Logs the full engine error internally and returns a sanitized one.
pub(crate) fn engine_error(e: impl std::fmt::Display) -> VisionError {
    error!(error = %e, "inference engine error");
    VisionError::InferenceEngine("internal inference error".into())
}

// ============================================================================
// Inference engine seam
// ============================================================================

/// One forward pass of a detection model.
///
/// Implementations receive an NCHW `[1, 3, H, W]` tensor with values in [0, 1] and
/// return the first output tensor unchanged.
pub trait InferenceEngine: Send {
    fn name(&self) -> &'static str;

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<RawTensor, VisionError>;
}

#[cfg(feature = "ml")]
pub use self::ort_engine::OrtEngine;

#[cfg(feature = "ml")]
mod ort_engine {
    use std::path::Path;

    use ndarray::ArrayView4;
    use ort::session::Session;
    use tracing::{debug, instrument};

    use super::{engine_error, InferenceEngine, VisionError};
    use crate::detection::RawTensor;

    /// ONNX Runtime engine: CPU only, one inter-op thread, fixed intra-op threads.
    pub struct OrtEngine {
        session: Session,
        output_names: Vec<String>,
    }

    impl OrtEngine {
        #[instrument(skip(model_path, output_name), fields(model = %model_path.display()))]
        pub fn load(
            model_path: &Path,
            intra_threads: usize,
            output_name: Option<&str>,
        ) -> Result<Self, VisionError> {
            if !model_path.is_file() {
                return Err(VisionError::ModelLoad(format!(
                    "model file not found: {}",
                    model_path.display()
                )));
            }

            let builder = Session::builder().map_err(engine_error)?;
            let builder = builder.with_intra_threads(intra_threads).map_err(engine_error)?;
            let mut builder = builder.with_inter_threads(1).map_err(engine_error)?;
            let session = builder.commit_from_file(model_path).map_err(engine_error)?;

            let mut output_names: Vec<String> = Vec::with_capacity(3);
            if let Some(name) = output_name {
                output_names.push(name.to_string());
            }
            output_names.extend(["output0".to_string(), "output".to_string()]);

            debug!(intra_threads, "onnx session ready");
            Ok(Self {
                session,
                output_names,
            })
        }
    }

    impl InferenceEngine for OrtEngine {
        fn name(&self) -> &'static str {
            "onnxruntime"
        }

        fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<RawTensor, VisionError> {
            let shape: [usize; 4] = [input.shape()[0], input.shape()[1], input.shape()[2], input.shape()[3]];
            let data: Vec<f32> = input.iter().copied().collect();
            let input_value = ort::value::Tensor::from_array((shape, data)).map_err(engine_error)?;

            let outputs = self
                .session
                .run(ort::inputs![input_value])
                .map_err(engine_error)?;

            let output_tensor = self
                .output_names
                .iter()
                .find_map(|name| outputs.get(name.as_str()))
                .ok_or_else(|| VisionError::Processing("model missing output node".into()))?;

            let (out_shape, out_data) = output_tensor
                .try_extract_tensor::<f32>()
                .map_err(engine_error)?;

            let mut dims = Vec::with_capacity(out_shape.len());
            for &dim in out_shape.iter() {
                let dim = usize::try_from(dim).map_err(|_| VisionError::InvalidOutputShape {
                    expected: "non-negative dimensions".into(),
                    got: format!("{out_shape:?}"),
                })?;
                dims.push(dim);
            }

            Ok(RawTensor::new(dims, out_data.to_vec()))
        }
    }
}

// ============================================================================
// Labels
// ============================================================================

/// Parses a label file: one label per line, blank lines and `#` comments skipped.
pub fn parse_labels(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

pub fn load_labels(path: &Path) -> Result<Vec<String>, VisionError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| VisionError::Labels(format!("{}: {e}", path.display())))?;
    let labels = parse_labels(&contents);
    if labels.is_empty() {
        return Err(VisionError::Labels(format!(
            "{} contains no labels",
            path.display()
        )));
    }
    Ok(labels)
}

// ============================================================================
// Detector
// ============================================================================

/// Lifecycle of the detector. `Closed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum DetectorStatus {
    Uninitialized,
    Ready,
    /// Model or labels failed to load; detection is disabled until a reload succeeds.
    Unavailable(String),
    Closed,
}

impl DetectorStatus {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Unavailable(_) => "unavailable",
            Self::Closed => "closed",
        }
    }
}

struct DetectorInner {
    status: DetectorStatus,
    engine: Option<Box<dyn InferenceEngine>>,
    labels: Arc<[String]>,
}

/// Food detector: preprocessing, one inference call, decoding and NMS.
///
/// # Thread Safety
///
/// Calls are serialized on an internal mutex; preprocessing happens outside it.
pub struct Detector {
    config: DetectorConfig,
    limits: ImageLimits,
    inner: Mutex<DetectorInner>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("status", &self.status())
            .field("input", &(self.config.input_width, self.config.input_height))
            .finish_non_exhaustive()
    }
}

impl Detector {
    /// Creates an uninitialized detector.
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            limits: ImageLimits::default(),
            inner: Mutex::new(DetectorInner {
                status: DetectorStatus::Uninitialized,
                engine: None,
                labels: Arc::from(Vec::new()),
            }),
        }
    }

    /// Creates a ready detector around an already-built engine.
    pub fn with_engine(
        config: DetectorConfig,
        engine: Box<dyn InferenceEngine>,
        labels: Vec<String>,
    ) -> Result<Self, VisionError> {
        let detector = Self::new(config);
        detector.install(engine, labels)?;
        Ok(detector)
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> DetectorStatus {
        self.lock().status.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().status == DetectorStatus::Ready
    }

    #[must_use]
    pub fn labels(&self) -> Arc<[String]> {
        Arc::clone(&self.lock().labels)
    }

    fn lock(&self) -> MutexGuard<'_, DetectorInner> {
        // A panic inside an engine leaves no partial state worth discarding.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Loads the model and labels named in the config.
    ///
    /// On failure the detector becomes `Unavailable` and the error is returned for
    /// logging; the app keeps running without detection.
    #[instrument(skip(self), fields(model = %self.config.model_path.display()))]
    pub fn load(&self) -> Result<(), VisionError> {
        if self.lock().status == DetectorStatus::Closed {
            return Err(VisionError::Closed);
        }

        let result = load_labels(&self.config.labels_path)
            .and_then(|labels| Ok((self.build_engine()?, labels)))
            .and_then(|(engine, labels)| self.install(engine, labels));

        if let Err(e) = &result {
            warn!(error = %e, "detector unavailable");
            let mut inner = self.lock();
            if inner.status != DetectorStatus::Closed {
                inner.status = DetectorStatus::Unavailable(e.to_string());
                inner.engine = None;
            }
        }
        result
    }

    #[cfg(feature = "ml")]
    fn build_engine(&self) -> Result<Box<dyn InferenceEngine>, VisionError> {
        let engine = OrtEngine::load(
            &self.config.model_path,
            self.config.intra_threads,
            self.config.output_name.as_deref(),
        )?;
        Ok(Box::new(engine))
    }

    #[cfg(not(feature = "ml"))]
    fn build_engine(&self) -> Result<Box<dyn InferenceEngine>, VisionError> {
        Err(VisionError::ModelLoad(
            "built without the `ml` feature; no inference engine available".into(),
        ))
    }

    fn install(&self, engine: Box<dyn InferenceEngine>, labels: Vec<String>) -> Result<(), VisionError> {
        self.config
            .validate()
            .map_err(|e| VisionError::ModelMismatch(e.to_string()))?;
        if labels.is_empty() {
            return Err(VisionError::Labels("label list is empty".into()));
        }

        let mut inner = self.lock();
        if inner.status == DetectorStatus::Closed {
            return Err(VisionError::Closed);
        }
        info!(engine = engine.name(), labels = labels.len(), "detector ready");
        inner.engine = Some(engine);
        inner.labels = Arc::from(labels);
        inner.status = DetectorStatus::Ready;
        Ok(())
    }

    /// Releases the engine. Further calls are rejected with `Closed`.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.status != DetectorStatus::Closed {
            inner.engine = None;
            inner.status = DetectorStatus::Closed;
            info!("detector closed");
        }
    }

    fn ensure_ready(&self) -> Result<(), VisionError> {
        match self.lock().status {
            DetectorStatus::Ready => Ok(()),
            DetectorStatus::Closed => Err(VisionError::Closed),
            ref other => Err(VisionError::NotReady {
                state: other.name().to_string(),
            }),
        }
    }

    /// Runs detection on an encoded photo (JPEG, PNG or WebP).
    #[must_use = "detection results should be used"]
    #[instrument(skip(self, image_data), fields(data_len = image_data.len()))]
    pub fn detect_bytes(&self, image_data: &[u8]) -> Result<DetectionResult, VisionError> {
        self.ensure_ready()?;
        let img = imaging::decode_image(&self.limits, image_data)?;
        self.detect_image(&img)
    }

    /// Runs detection on a raw RGB8 frame (live capture).
    #[must_use = "detection results should be used"]
    pub fn detect_rgb(&self, rgb: Vec<u8>, width: u32, height: u32) -> Result<DetectionResult, VisionError> {
        self.ensure_ready()?;
        let len = rgb.len();
        let frame = RgbImage::from_raw(width, height, rgb)
            .filter(|_| width > 0 && height > 0)
            .ok_or(VisionError::InvalidFrame { width, height, len })?;
        self.detect_image(&DynamicImage::ImageRgb8(frame))
    }

    /// Runs detection on a decoded image of any size.
    #[must_use = "detection results should be used"]
    #[instrument(skip(self, img), fields(width = img.width(), height = img.height()))]
    pub fn detect_image(&self, img: &DynamicImage) -> Result<DetectionResult, VisionError> {
        self.ensure_ready()?;

        let (orig_w, orig_h) = (img.width(), img.height());
        if orig_w == 0 || orig_h == 0 {
            return Err(ImagingError::InvalidDimensions {
                width: orig_w,
                height: orig_h,
            }
            .into());
        }

        let preprocess_start = Instant::now();
        let input = preprocess(img, self.config.input_width, self.config.input_height);
        let preprocess_ms = preprocess_start.elapsed().as_secs_f64() * 1000.0;

        let mut guard = self.lock();
        let DetectorInner {
            status,
            engine,
            labels,
        } = &mut *guard;
        let labels = Arc::clone(labels);
        let engine = match (&*status, engine.as_mut()) {
            (DetectorStatus::Ready, Some(engine)) => engine,
            (DetectorStatus::Closed, _) => return Err(VisionError::Closed),
            (status, _) => {
                return Err(VisionError::NotReady {
                    state: status.name().to_string(),
                })
            }
        };

        let inference_start = Instant::now();
        let raw = engine.run(input.view())?;
        drop(guard);
        let inference_ms = inference_start.elapsed().as_secs_f64() * 1000.0;

        let postprocess_start = Instant::now();
        let decode = DecodeParams {
            input_width: self.config.input_width,
            input_height: self.config.input_height,
            orig_width: orig_w,
            orig_height: orig_h,
            score_threshold: self.config.score_threshold,
            box_format: self.config.box_format,
        };
        let nms = NmsParams {
            iou_threshold: self.config.iou_threshold,
            max_results: self.config.max_results,
            max_candidates: self.config.max_nms_candidates,
        };
        let (detections, truncated, candidates_before_nms) =
            detection::postprocess(&raw, &labels, &decode, &nms)?;
        let postprocess_ms = postprocess_start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            detections = detections.len(),
            truncated,
            candidates_before_nms,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
            "Detection completed"
        );

        Ok(DetectionResult {
            detections,
            truncated,
            candidates_before_nms,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
        })
    }
}

/// Bilinear resize to the model input, RGB, scaled to [0, 1], NCHW with a batch axis.
#[must_use]
pub fn preprocess(img: &DynamicImage, input_width: u32, input_height: u32) -> Array4<f32> {
    let resized = img.resize_exact(input_width, input_height, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let (w, h) = (input_width as usize, input_height as usize);
    let raw = rgb.as_raw();
    Array4::from_shape_fn((1, 3, h, w), |(_, channel, y, x)| {
        f32::from(raw[(y * w + x) * 3 + channel]) / 255.0
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::imaging::tests::create_test_png;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a canned output and counts calls.
    pub(crate) struct FixedEngine {
        pub output: RawTensor,
        pub calls: Arc<AtomicUsize>,
    }

    impl FixedEngine {
        pub(crate) fn new(output: RawTensor) -> Self {
            Self {
                output,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl InferenceEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<RawTensor, VisionError> {
            assert_eq!(input.shape()[0], 1);
            assert_eq!(input.shape()[1], 3);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&mut self, _input: ArrayView4<'_, f32>) -> Result<RawTensor, VisionError> {
            Err(engine_error("session exploded"))
        }
    }

    /// Two anchors in feature-major layout over labels [apple, banana]:
    /// an apple in the left half and a banana in the right half.
    pub(crate) fn two_food_output() -> RawTensor {
        RawTensor::new(
            vec![1, 6, 2],
            vec![
                0.25, 0.75, // cx
                0.5, 0.5, // cy
                0.4, 0.4, // w
                0.8, 0.8, // h
                0.9, 0.1, // apple
                0.05, 0.7, // banana
            ],
        )
    }

    pub(crate) fn food_labels() -> Vec<String> {
        vec!["apple".to_string(), "banana".to_string()]
    }

    fn small_config() -> DetectorConfig {
        DetectorConfig {
            input_width: 32,
            input_height: 32,
            ..Default::default()
        }
    }

    fn ready_detector() -> Detector {
        Detector::with_engine(small_config(), Box::new(FixedEngine::new(two_food_output())), food_labels())
            .unwrap()
    }

    #[test]
    fn parse_labels_skips_blanks_and_comments() {
        let labels = parse_labels("# foods\napple\n\n  banana  \n#x\nfried rice\n");
        assert_eq!(labels, vec!["apple", "banana", "fried rice"]);
    }

    #[test]
    fn load_labels_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "# nothing here\n\n").unwrap();
        assert!(matches!(load_labels(&path), Err(VisionError::Labels(_))));
    }

    #[test]
    fn preprocess_shape_and_range() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 50, image::Rgb([255, 0, 128])));
        let tensor = preprocess(&img, 16, 8);
        assert_eq!(tensor.shape(), &[1, 3, 8, 16]);
        assert!((tensor[[0, 0, 4, 4]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 1, 4, 4]], 0.0);
        assert!((tensor[[0, 2, 4, 4]] - 128.0 / 255.0).abs() < 1e-6);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn new_detector_is_uninitialized_and_rejects_calls() {
        let detector = Detector::new(small_config());
        assert_eq!(detector.status(), DetectorStatus::Uninitialized);
        let result = detector.detect_bytes(&create_test_png(10, 10));
        assert!(matches!(result, Err(VisionError::NotReady { ref state }) if state == "uninitialized"));
    }

    #[test]
    fn load_failure_marks_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = DetectorConfig {
            model_path: dir.path().join("missing.onnx"),
            labels_path: dir.path().join("missing.txt"),
            ..small_config()
        };
        let detector = Detector::new(config);

        assert!(detector.load().is_err());
        assert!(matches!(detector.status(), DetectorStatus::Unavailable(_)));
        assert!(!detector.is_ready());
        assert!(matches!(
            detector.detect_rgb(vec![0; 12], 2, 2),
            Err(VisionError::NotReady { .. })
        ));
    }

    #[test]
    fn detects_and_rescales_to_original_image() {
        let detector = ready_detector();
        let result = detector.detect_bytes(&create_test_png(200, 100)).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.candidates_before_nms, 2);
        let apple = &result.detections[0];
        assert_eq!(apple.label, "apple");
        assert!((apple.bbox.left - 10.0).abs() < 1e-3);
        assert!((apple.bbox.right - 90.0).abs() < 1e-3);
        assert!((apple.bbox.top - 10.0).abs() < 1e-3);
        assert!((apple.bbox.bottom - 90.0).abs() < 1e-3);
        assert_eq!(result.detections[1].label, "banana");
    }

    #[test]
    fn raw_frames_are_validated() {
        let detector = ready_detector();
        assert!(matches!(
            detector.detect_rgb(vec![0; 10], 2, 2),
            Err(VisionError::InvalidFrame { len: 10, .. })
        ));
        let result = detector.detect_rgb(vec![0; 4 * 4 * 3], 4, 4).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn empty_result_is_distinct_from_unavailable() {
        let nothing = RawTensor::new(vec![1, 6, 1], vec![0.5, 0.5, 0.1, 0.1, 0.01, 0.02]);
        let detector =
            Detector::with_engine(small_config(), Box::new(FixedEngine::new(nothing)), food_labels()).unwrap();
        let result = detector.detect_rgb(vec![0; 8 * 8 * 3], 8, 8).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn label_count_mismatch_is_reported() {
        let detector = Detector::with_engine(
            small_config(),
            Box::new(FixedEngine::new(two_food_output())),
            vec!["apple".into(), "banana".into(), "carrot".into()],
        )
        .unwrap();
        assert!(matches!(
            detector.detect_rgb(vec![0; 12], 2, 2),
            Err(VisionError::ModelMismatch(_))
        ));
    }

    #[test]
    fn engine_errors_are_sanitized() {
        let detector = Detector::with_engine(small_config(), Box::new(FailingEngine), food_labels()).unwrap();
        let err = detector.detect_rgb(vec![0; 12], 2, 2).unwrap_err();
        assert!(matches!(err, VisionError::InferenceEngine(ref msg) if !msg.contains("exploded")));
        assert!(detector.is_ready());
    }

    #[test]
    fn closed_is_terminal() {
        let detector = ready_detector();
        detector.close();
        assert_eq!(detector.status(), DetectorStatus::Closed);
        assert!(matches!(detector.detect_rgb(vec![0; 12], 2, 2), Err(VisionError::Closed)));
        assert!(matches!(detector.load(), Err(VisionError::Closed)));
        assert!(matches!(
            detector.install(Box::new(FixedEngine::new(two_food_output())), food_labels()),
            Err(VisionError::Closed)
        ));
        // closing twice is harmless
        detector.close();
        assert_eq!(detector.status(), DetectorStatus::Closed);
    }

    #[test]
    fn detection_is_deterministic() {
        let detector = ready_detector();
        let png = create_test_png(64, 64);
        let a = detector.detect_bytes(&png).unwrap();
        let b = detector.detect_bytes(&png).unwrap();
        assert_eq!(a.detections, b.detections);
    }

    #[test]
    fn status_serializes_with_reason() {
        let json = serde_json::to_string(&DetectorStatus::Unavailable("no model".into())).unwrap();
        assert_eq!(json, r#"{"state":"unavailable","reason":"no model"}"#);
        let json = serde_json::to_string(&DetectorStatus::Ready).unwrap();
        assert_eq!(json, r#"{"state":"ready"}"#);
    }
}
