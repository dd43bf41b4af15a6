use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest model input side we accept from configuration.
pub const MAX_INPUT_SIDE: u32 = 4096;

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const DEFAULT_MAX_NMS_CANDIDATES: usize = 300;
pub const DEFAULT_INTRA_THREADS: usize = 2;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How box coordinates are expressed in the raw model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxFormat {
    /// `cx, cy, w, h` in [0, 1] relative to the model input.
    #[default]
    Normalized,
    /// `cx, cy, w, h` in model-input pixels.
    Pixels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    /// Output node to read; `output0` and `output` are tried when unset.
    pub output_name: Option<String>,
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub max_results: usize,
    pub max_nms_candidates: usize,
    pub box_format: BoxFormat,
    pub intra_threads: usize,
    pub frame_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/food_detector.onnx"),
            labels_path: PathBuf::from("models/food_labels.txt"),
            output_name: None,
            input_width: DEFAULT_INPUT_SIZE,
            input_height: DEFAULT_INPUT_SIZE,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_results: DEFAULT_MAX_RESULTS,
            max_nms_candidates: DEFAULT_MAX_NMS_CANDIDATES,
            box_format: BoxFormat::Normalized,
            intra_threads: DEFAULT_INTRA_THREADS,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, side) in [("input_width", self.input_width), ("input_height", self.input_height)] {
            if side == 0 || side > MAX_INPUT_SIDE {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{side} is outside 1..={MAX_INPUT_SIDE}"),
                });
            }
        }

        for (field, value) in [
            ("score_threshold", self.score_threshold),
            ("iou_threshold", self.iou_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is outside [0, 1]"),
                });
            }
        }

        if self.max_results == 0 {
            return Err(ConfigError::Invalid {
                field: "max_results",
                reason: "must be at least 1".into(),
            });
        }

        if self.max_nms_candidates < self.max_results {
            return Err(ConfigError::Invalid {
                field: "max_nms_candidates",
                reason: format!(
                    "{} is smaller than max_results {}",
                    self.max_nms_candidates, self.max_results
                ),
            });
        }

        if self.intra_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "intra_threads",
                reason: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Top-level configuration handed over by the shell at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub history_db: Option<PathBuf>,
    pub preferences_file: Option<PathBuf>,
    pub photo_dir: Option<PathBuf>,
    pub nutrition_table: PathBuf,
    pub detector: DetectorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            history_db: None,
            preferences_file: None,
            photo_dir: None,
            nutrition_table: PathBuf::from("assets/nutrition.json"),
            detector: DetectorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "data_dir",
                reason: "cannot be empty".into(),
            });
        }
        self.detector.validate()
    }

    #[must_use]
    pub fn history_db_path(&self) -> PathBuf {
        self.history_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("history.sqlite3"))
    }

    #[must_use]
    pub fn preferences_path(&self) -> PathBuf {
        self.preferences_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("preferences.json"))
    }

    #[must_use]
    pub fn photo_dir_path(&self) -> PathBuf {
        self.photo_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("photos"))
    }
}
