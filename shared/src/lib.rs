// lib.rs - shared core of the calorie lens app

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod app;
pub mod config;
pub mod detection;
pub mod history;
pub mod imaging;
pub mod nutrition;
pub mod preferences;
pub mod profile;
pub mod service;
pub mod throttle;
pub mod vision;

use serde::{Deserialize, Serialize};

pub use app::{App, Capabilities, Effect, Event, Model, ViewModel};
pub use config::{AppConfig, BoxFormat, ConfigError, DetectorConfig};
pub use crux_core::{render::Render, App as CruxApp};
pub use detection::{BoundingBox, Detection, DetectionResult};
pub use history::{HistoryEntry, HistoryError, HistoryStore, MealSession, NewHistoryEntry};
pub use nutrition::{FoodItem, FoodNutrition, FoodSource, MealEstimate, NutritionError, NutritionTable};
pub use profile::{ActivityLevel, ProfileError, Sex, UserProfile, WeightGoal};
pub use vision::{Detector, DetectorStatus, InferenceEngine, VisionError};

pub const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_HISTORY_PAGE: usize = 50;
pub const MAX_STAGED_ITEMS: usize = 64;
pub const MAX_PORTION_GRAMS: f32 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Configuration,
    Storage,
    ImageProcessing,
    ImageTooLarge,
    ImageFormatUnsupported,
    DetectorUnavailable,
    Inference,
    NutritionLookup,
    NotFound,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::ImageFormatUnsupported => "IMAGE_FORMAT_UNSUPPORTED",
            Self::DetectorUnavailable => "DETECTOR_UNAVAILABLE",
            Self::Inference => "INFERENCE_ERROR",
            Self::NutritionLookup => "NUTRITION_LOOKUP_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Validation => "Please check the values you entered.",
            Self::Configuration => "The app is not configured correctly.",
            Self::Storage => "Could not save your data. Please try again.",
            Self::ImageProcessing => "Could not read this photo.",
            Self::ImageTooLarge => "This photo is too large.",
            Self::ImageFormatUnsupported => "This photo format is not supported.",
            Self::DetectorUnavailable => "Food recognition is unavailable. You can still add food manually.",
            Self::Inference => "Food recognition failed for this photo.",
            Self::NutritionLookup => "No nutrition data for this food.",
            Self::NotFound => "That item no longer exists.",
            Self::InvalidState => "That action is not available right now.",
            Self::Internal => "Something went wrong.",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<VisionError> for AppError {
    fn from(e: VisionError) -> Self {
        let e = match e {
            VisionError::Imaging(inner) => return AppError::from(inner),
            other => other,
        };
        let kind = match &e {
            VisionError::NotReady { .. } | VisionError::Closed => ErrorKind::DetectorUnavailable,
            VisionError::Imaging(_) => ErrorKind::ImageProcessing,
            VisionError::InvalidFrame { .. } => ErrorKind::Validation,
            VisionError::InvalidOutputShape { .. }
            | VisionError::ModelMismatch(_)
            | VisionError::InferenceEngine(_) => ErrorKind::Inference,
            VisionError::ModelLoad(_) | VisionError::Labels(_) => ErrorKind::DetectorUnavailable,
            VisionError::Processing(_) => ErrorKind::Internal,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<imaging::ImagingError> for AppError {
    fn from(e: imaging::ImagingError) -> Self {
        use imaging::ImagingError;
        let kind = match &e {
            ImagingError::CompressedTooLarge { .. } | ImagingError::ImageTooLarge { .. } => {
                ErrorKind::ImageTooLarge
            }
            ImagingError::UnsupportedFormat(_) => ErrorKind::ImageFormatUnsupported,
            ImagingError::Io(_) => ErrorKind::Storage,
            _ => ErrorKind::ImageProcessing,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<NutritionError> for AppError {
    fn from(e: NutritionError) -> Self {
        let kind = match &e {
            NutritionError::UnknownFood(_) => ErrorKind::NutritionLookup,
            NutritionError::InvalidPortion(_) | NutritionError::InvalidRecord { .. } => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Configuration,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<HistoryError> for AppError {
    fn from(e: HistoryError) -> Self {
        let kind = match &e {
            HistoryError::NotFound(_) => ErrorKind::NotFound,
            HistoryError::Invalid(_) => ErrorKind::Validation,
            _ => ErrorKind::Storage,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<ProfileError> for AppError {
    fn from(e: ProfileError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<preferences::PreferenceError> for AppError {
    fn from(e: preferences::PreferenceError) -> Self {
        AppError::new(ErrorKind::Storage, e.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

/// Explicit timestamp unit: milliseconds since the Unix epoch, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Start of the UTC day containing this instant.
    #[must_use]
    pub fn day_start(self) -> Self {
        Self(self.0 - self.0 % MS_PER_DAY)
    }

    #[must_use]
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_start_truncates_to_midnight_utc() {
        let t = UnixTimeMs(3 * MS_PER_DAY + 12_345);
        assert_eq!(t.day_start(), UnixTimeMs(3 * MS_PER_DAY));
        assert_eq!(UnixTimeMs(0).day_start(), UnixTimeMs(0));
    }

    #[test]
    fn detector_errors_map_to_unavailable_kind() {
        let err: AppError = VisionError::Closed.into();
        assert_eq!(err.kind, ErrorKind::DetectorUnavailable);

        let err: AppError = VisionError::NotReady {
            state: "uninitialized".into(),
        }
        .into();
        assert_eq!(err.code(), "DETECTOR_UNAVAILABLE");
    }

    #[test]
    fn history_not_found_maps_to_not_found() {
        let err: AppError = HistoryError::NotFound(7).into();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.to_string().contains("NOT_FOUND"));

        let err: AppError = HistoryError::Invalid("a meal needs at least one item".into()).into();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn every_kind_has_a_user_message() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Storage,
            ErrorKind::DetectorUnavailable,
            ErrorKind::Inference,
            ErrorKind::Internal,
        ] {
            assert!(!kind.user_message().is_empty());
        }
    }
}
