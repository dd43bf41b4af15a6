use std::path::Path;
use std::sync::Arc;

use crux_core::render::Render;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::detection::{Detection, DetectionResult};
use crate::history::{HistoryEntry, HistoryStore, MealSession, NewHistoryEntry};
use crate::imaging::MealPhotoStore;
use crate::nutrition::{total_calories, FoodItem, FoodSource, NutritionTable};
use crate::preferences::{PrefKey, PreferenceError, PreferenceStore};
use crate::profile::UserProfile;
use crate::service::DetectionService;
use crate::throttle::FrameThrottle;
use crate::vision::{Detector, DetectorStatus, VisionError};
use crate::{
    get_current_time_ms, AppError, AppResult, ErrorKind, UnixTimeMs, DEFAULT_HISTORY_PAGE, MAX_STAGED_ITEMS, MS_PER_DAY,
};

const PROFILE_KEY: &str = "user";
const LIVE_DETECTION_KEY: &str = "live_detection";

// ============================================================================
// Events
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    AppStarted {
        config: AppConfig,
    },
    AppClosing,

    // Capture
    PhotoCaptured {
        bytes: Vec<u8>,
    },
    LiveFrameReceived {
        rgb: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: u64,
    },
    LiveDetectionToggled {
        enabled: bool,
    },

    // Staging
    ManualItemAdded {
        label: String,
        grams: Option<f32>,
    },
    CustomItemAdded {
        name: String,
        calories_per_100g: f32,
        grams: f32,
    },
    StagedItemRemoved {
        index: usize,
    },
    StagedItemPortionChanged {
        index: usize,
        grams: f32,
    },
    MealSessionSelected {
        session: MealSession,
    },
    MealSaved,
    StagingCleared,

    // History
    DaySelected {
        day_start_ms: u64,
    },
    HistoryEntryDeleted {
        id: i64,
    },
    HistoryEntryUpdated {
        entry: HistoryEntry,
    },

    ProfileUpdated {
        profile: UserProfile,
    },
    ErrorDismissed,
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppStarted { .. } => "app_started",
            Self::AppClosing => "app_closing",
            Self::PhotoCaptured { .. } => "photo_captured",
            Self::LiveFrameReceived { .. } => "live_frame_received",
            Self::LiveDetectionToggled { .. } => "live_detection_toggled",
            Self::ManualItemAdded { .. } => "manual_item_added",
            Self::CustomItemAdded { .. } => "custom_item_added",
            Self::StagedItemRemoved { .. } => "staged_item_removed",
            Self::StagedItemPortionChanged { .. } => "staged_item_portion_changed",
            Self::MealSessionSelected { .. } => "meal_session_selected",
            Self::MealSaved => "meal_saved",
            Self::StagingCleared => "staging_cleared",
            Self::DaySelected { .. } => "day_selected",
            Self::HistoryEntryDeleted { .. } => "history_entry_deleted",
            Self::HistoryEntryUpdated { .. } => "history_entry_updated",
            Self::ProfileUpdated { .. } => "profile_updated",
            Self::ErrorDismissed => "error_dismissed",
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
}

// ============================================================================
// Model
// ============================================================================

pub struct Model {
    pub config: Option<AppConfig>,
    pub detector: Arc<Detector>,
    pub nutrition: NutritionTable,
    pub history: Option<HistoryStore>,
    pub preferences: Option<PreferenceStore>,
    pub photos: Option<MealPhotoStore>,
    pub throttle: FrameThrottle,
    pub live_detection: bool,

    // Meal being composed
    pub staged: Vec<FoodItem>,
    pub staged_photo: Option<String>,
    pub session: Option<MealSession>,
    pub latest_detections: Option<DetectionResult>,
    pub unmatched_labels: Vec<String>,

    pub profile: Option<UserProfile>,
    pub selected_day: UnixTimeMs,
    pub day_entries: Vec<HistoryEntry>,
    pub day_consumed: u32,
    pub recent_entries: Vec<HistoryEntry>,

    pub active_error: Option<AppError>,
    pub view_timestamp_ms: u64,
    pub closed: bool,
}

impl Default for Model {
    fn default() -> Self {
        let now = UnixTimeMs::now();
        Self {
            config: None,
            detector: Arc::new(Detector::default()),
            nutrition: NutritionTable::default(),
            history: None,
            preferences: None,
            photos: None,
            throttle: FrameThrottle::default(),
            live_detection: false,
            staged: Vec::new(),
            staged_photo: None,
            session: None,
            latest_detections: None,
            unmatched_labels: Vec::new(),
            profile: None,
            selected_day: now.day_start(),
            day_entries: Vec::new(),
            day_consumed: 0,
            recent_entries: Vec::new(),
            active_error: None,
            view_timestamp_ms: now.as_millis(),
            closed: false,
        }
    }
}

impl Model {
    pub fn update_timestamp(&mut self) {
        self.view_timestamp_ms = get_current_time_ms();
    }

    pub fn set_error(&mut self, error: impl Into<AppError>) {
        let error = error.into();
        debug!(code = error.code(), message = %error.message, "error surfaced");
        self.active_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }

    #[must_use]
    pub fn staged_total(&self) -> u32 {
        total_calories(&self.staged)
    }

    #[must_use]
    pub fn daily_target(&self) -> Option<u32> {
        self.profile.as_ref().and_then(|p| p.daily_calorie_target().ok())
    }

    /// Async detection front end sharing this model's detector.
    #[must_use]
    pub fn detection_service(&self) -> DetectionService {
        DetectionService::new(Arc::clone(&self.detector))
    }

    fn stage(&mut self, items: Vec<FoodItem>) {
        let room = MAX_STAGED_ITEMS.saturating_sub(self.staged.len());
        let dropped = items.len().saturating_sub(room);
        self.staged.extend(items.into_iter().take(room));
        if dropped > 0 {
            warn!(dropped, "staging full");
            self.set_error(AppError::new(
                ErrorKind::Validation,
                format!("a meal holds at most {MAX_STAGED_ITEMS} items"),
            ));
        }
    }

    fn discard_staged_photo(&mut self) {
        let (Some(path), Some(photos)) = (self.staged_photo.take(), self.photos.as_ref()) else {
            return;
        };
        if let Err(e) = photos.delete(Path::new(&path)) {
            warn!(error = %e, path = %path, "failed to remove unsaved photo");
        }
    }

    fn clear_staging(&mut self) {
        self.staged.clear();
        self.staged_photo = None;
        self.session = None;
        self.latest_detections = None;
        self.unmatched_labels.clear();
    }

    /// Drops items detected in the previous photo; manual entries stay.
    fn replace_photo(&mut self, path: Option<String>) {
        self.discard_staged_photo();
        self.staged.retain(|item| item.source == FoodSource::Manual);
        self.latest_detections = None;
        self.unmatched_labels.clear();
        self.staged_photo = path;
    }

    fn refresh_day(&mut self) {
        let Some(history) = self.history.as_ref() else {
            self.day_entries.clear();
            self.day_consumed = 0;
            self.recent_entries.clear();
            return;
        };
        match read_history(history, self.selected_day) {
            Ok(snapshot) => {
                self.day_entries = snapshot.day_entries;
                self.day_consumed = snapshot.day_consumed;
                self.recent_entries = snapshot.recent_entries;
            }
            Err(e) => self.set_error(e),
        }
    }
}

struct HistorySnapshot {
    day_entries: Vec<HistoryEntry>,
    day_consumed: u32,
    recent_entries: Vec<HistoryEntry>,
}

fn read_history(history: &HistoryStore, day: UnixTimeMs) -> AppResult<HistorySnapshot> {
    let start = day.as_millis();
    let end = day.saturating_add_ms(MS_PER_DAY).as_millis();
    Ok(HistorySnapshot {
        day_entries: history.list_between(start, end)?,
        day_consumed: history.total_calories_between(start, end)?,
        recent_entries: history.list_recent(DEFAULT_HISTORY_PAGE)?,
    })
}

// ============================================================================
// View model
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorView {
    pub code: String,
    pub title: String,
    pub detail: String,
}

impl From<&AppError> for ErrorView {
    fn from(e: &AppError) -> Self {
        Self {
            code: e.code().to_string(),
            title: e.user_message().to_string(),
            detail: e.message.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub detector_status: DetectorStatus,
    pub detector_available: bool,
    pub live_detection: bool,

    pub detections: Vec<Detection>,
    pub detections_truncated: bool,
    pub unmatched_labels: Vec<String>,

    pub staged_items: Vec<FoodItem>,
    pub staged_total_calories: u32,
    pub staged_photo: Option<String>,
    pub meal_session: MealSession,

    pub profile: Option<UserProfile>,
    pub daily_target: Option<u32>,
    pub selected_day_ms: u64,
    pub consumed_calories: u32,
    /// Negative once the target is exceeded.
    pub remaining_calories: Option<i64>,
    pub day_entries: Vec<HistoryEntry>,
    /// Newest first, one page.
    pub recent_entries: Vec<HistoryEntry>,

    pub error: Option<ErrorView>,
}

// ============================================================================
// App
// ============================================================================

#[derive(Default)]
pub struct App;

impl App {
    fn start(model: &mut Model, config: AppConfig) {
        if model.closed {
            model.set_error(AppError::new(ErrorKind::InvalidState, "app is closing"));
            return;
        }
        if let Err(e) = config.validate() {
            model.set_error(e);
            return;
        }

        model.nutrition = match NutritionTable::load(&config.nutrition_table) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "nutrition table unavailable");
                model.set_error(e);
                NutritionTable::default()
            }
        };

        model.history = match HistoryStore::open(config.history_db_path()) {
            Ok(store) => Some(store),
            Err(e) => {
                model.set_error(e);
                None
            }
        };

        model.photos = match MealPhotoStore::open(config.photo_dir_path()) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "photo storage unavailable");
                None
            }
        };

        match PreferenceStore::open(config.preferences_path()) {
            Ok(prefs) => {
                Self::restore_preferences(model, &prefs);
                model.preferences = Some(prefs);
            }
            Err(e) => model.set_error(e),
        }

        model.throttle = FrameThrottle::new(config.detector.frame_interval_ms);
        let detector = Detector::new(config.detector.clone());
        if let Err(e) = detector.load() {
            // The status carries the reason; the rest of the app works without detection.
            warn!(error = %e, "continuing without food detection");
        }
        model.detector.close();
        model.detector = Arc::new(detector);

        model.config = Some(config);
        model.refresh_day();
        info!(
            detector = model.detector.status().name(),
            foods = model.nutrition.len(),
            "app started"
        );
    }

    fn restore_preferences(model: &mut Model, prefs: &PreferenceStore) {
        let profile = PrefKey::profile(PROFILE_KEY).and_then(|key| prefs.get::<UserProfile>(&key));
        match profile {
            Ok(profile) => model.profile = profile,
            Err(e) => warn!(error = %e, "stored profile unreadable"),
        }

        let live = PrefKey::settings(LIVE_DETECTION_KEY).and_then(|key| prefs.get::<bool>(&key));
        match live {
            Ok(live) => model.live_detection = live.unwrap_or(false),
            Err(e) => warn!(error = %e, "stored live detection setting unreadable"),
        }
    }

    fn save_preference<T: Serialize>(model: &mut Model, key: Result<PrefKey, PreferenceError>, value: &T) {
        let Some(prefs) = model.preferences.as_mut() else {
            return;
        };
        if let Err(e) = key.and_then(|key| prefs.set(&key, value)) {
            model.set_error(e);
        }
    }

    fn photo_captured(model: &mut Model, bytes: &[u8]) {
        let saved = model.photos.as_ref().map(|photos| photos.save(bytes)).transpose();
        match saved {
            Ok(path) => model.replace_photo(path.map(|p| p.to_string_lossy().into_owned())),
            Err(e) => {
                model.set_error(e);
                return;
            }
        }

        match model.detector.detect_bytes(bytes) {
            Ok(result) => {
                let estimate = model.nutrition.estimate_meal(&result.detections);
                debug!(
                    detections = result.len(),
                    matched = estimate.items.len(),
                    unmatched = estimate.unmatched_labels.len(),
                    "photo analysed"
                );
                model.unmatched_labels = estimate.unmatched_labels;
                model.latest_detections = Some(result);
                model.stage(estimate.items);
            }
            Err(e) => model.set_error(e),
        }
    }

    fn live_frame(model: &mut Model, rgb: Vec<u8>, width: u32, height: u32, timestamp_ms: u64) {
        if !model.live_detection || !model.throttle.should_process(timestamp_ms) {
            return;
        }

        match model.detector.detect_rgb(rgb, width, height) {
            Ok(result) => model.latest_detections = Some(result),
            Err(e @ (VisionError::NotReady { .. } | VisionError::Closed)) => {
                warn!(error = %e, "live detection stopped");
                model.live_detection = false;
                model.latest_detections = None;
                model.set_error(e);
            }
            Err(e) => {
                warn!(error = %e, timestamp_ms, "live frame failed");
                model.set_error(e);
            }
        }
    }

    fn save_meal(model: &mut Model) {
        if model.staged.is_empty() {
            model.set_error(AppError::new(ErrorKind::Validation, "add at least one food before saving"));
            return;
        }
        let Some(history) = model.history.as_ref() else {
            model.set_error(AppError::new(ErrorKind::Storage, "meal history is not available"));
            return;
        };

        let now = get_current_time_ms();
        let entry = NewHistoryEntry {
            created_at_ms: now,
            session: model.session.unwrap_or_else(|| MealSession::for_time(now)),
            image_path: model.staged_photo.clone(),
            items: model.staged.clone(),
        };
        match history.insert(entry) {
            Ok(saved) => {
                info!(id = saved.id, calories = saved.total_calories, "meal logged");
                model.clear_staging();
                model.selected_day = UnixTimeMs(now).day_start();
                model.refresh_day();
            }
            Err(e) => model.set_error(e),
        }
    }

    fn delete_entry(model: &mut Model, id: i64) {
        let Some(history) = model.history.as_ref() else {
            model.set_error(AppError::new(ErrorKind::Storage, "meal history is not available"));
            return;
        };

        let image_path = match history.image_path(id) {
            Ok(path) => path,
            Err(e) => {
                model.set_error(e);
                return;
            }
        };
        match history.delete(id) {
            Ok(true) => {
                if let (Some(path), Some(photos)) = (image_path, model.photos.as_ref()) {
                    if let Err(e) = photos.delete(Path::new(&path)) {
                        warn!(error = %e, id, "failed to remove meal photo");
                    }
                }
            }
            Ok(false) => model.set_error(crate::history::HistoryError::NotFound(id)),
            Err(e) => model.set_error(e),
        }
        model.refresh_day();
    }

    fn update_entry(model: &mut Model, entry: &HistoryEntry) {
        let Some(history) = model.history.as_ref() else {
            model.set_error(AppError::new(ErrorKind::Storage, "meal history is not available"));
            return;
        };
        if let Err(e) = history.update(entry) {
            model.set_error(e);
        }
        model.refresh_day();
    }
}

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        model.update_timestamp();
        debug!(event = event.name(), "update");

        match event {
            Event::AppStarted { config } => Self::start(model, config),

            Event::AppClosing => {
                model.discard_staged_photo();
                model.clear_staging();
                model.detector.close();
                model.history = None;
                model.photos = None;
                model.closed = true;
                info!("app closed");
            }

            Event::PhotoCaptured { bytes } => Self::photo_captured(model, &bytes),

            Event::LiveFrameReceived {
                rgb,
                width,
                height,
                timestamp_ms,
            } => Self::live_frame(model, rgb, width, height, timestamp_ms),

            Event::LiveDetectionToggled { enabled } => {
                model.live_detection = enabled;
                model.throttle.reset();
                if !enabled {
                    model.latest_detections = None;
                }
                Self::save_preference(model, PrefKey::settings(LIVE_DETECTION_KEY), &enabled);
            }

            Event::ManualItemAdded { label, grams } => match model.nutrition.manual_item(&label, grams) {
                Ok(item) => model.stage(vec![item]),
                Err(e) => model.set_error(e),
            },

            Event::CustomItemAdded {
                name,
                calories_per_100g,
                grams,
            } => match NutritionTable::custom_item(&name, calories_per_100g, grams) {
                Ok(item) => model.stage(vec![item]),
                Err(e) => model.set_error(e),
            },

            Event::StagedItemRemoved { index } => {
                if index < model.staged.len() {
                    model.staged.remove(index);
                } else {
                    model.set_error(AppError::new(
                        ErrorKind::Validation,
                        format!("no staged item at position {index}"),
                    ));
                }
            }

            Event::StagedItemPortionChanged { index, grams } => {
                let result = model
                    .staged
                    .get_mut(index)
                    .map(|item| item.set_grams(grams));
                match result {
                    Some(Ok(())) => {}
                    Some(Err(e)) => model.set_error(e),
                    None => model.set_error(AppError::new(
                        ErrorKind::Validation,
                        format!("no staged item at position {index}"),
                    )),
                }
            }

            Event::MealSessionSelected { session } => model.session = Some(session),

            Event::MealSaved => Self::save_meal(model),

            Event::StagingCleared => {
                model.discard_staged_photo();
                model.clear_staging();
            }

            Event::DaySelected { day_start_ms } => {
                model.selected_day = UnixTimeMs(day_start_ms).day_start();
                model.refresh_day();
            }

            Event::HistoryEntryDeleted { id } => Self::delete_entry(model, id),

            Event::HistoryEntryUpdated { entry } => Self::update_entry(model, &entry),

            Event::ProfileUpdated { profile } => match profile.validate() {
                Ok(()) => {
                    Self::save_preference(model, PrefKey::profile(PROFILE_KEY), &profile);
                    model.profile = Some(profile);
                }
                Err(e) => model.set_error(e),
            },

            Event::ErrorDismissed => model.clear_error(),
        }

        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        let detector_status = model.detector.status();
        let daily_target = model.daily_target();
        let (detections, detections_truncated) = model
            .latest_detections
            .as_ref()
            .map_or((Vec::new(), false), |r| (r.detections.clone(), r.truncated));

        ViewModel {
            detector_available: detector_status == DetectorStatus::Ready,
            detector_status,
            live_detection: model.live_detection,
            detections,
            detections_truncated,
            unmatched_labels: model.unmatched_labels.clone(),
            staged_items: model.staged.clone(),
            staged_total_calories: model.staged_total(),
            staged_photo: model.staged_photo.clone(),
            meal_session: model
                .session
                .unwrap_or_else(|| MealSession::for_time(model.view_timestamp_ms)),
            profile: model.profile.clone(),
            daily_target,
            selected_day_ms: model.selected_day.as_millis(),
            consumed_calories: model.day_consumed,
            remaining_calories: daily_target.map(|t| i64::from(t) - i64::from(model.day_consumed)),
            day_entries: model.day_entries.clone(),
            recent_entries: model.recent_entries.clone(),
            error: model.active_error.as_ref().map(ErrorView::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nutrition::FoodSource;
    use crate::profile::{ActivityLevel, Sex, WeightGoal};
    use crux_core::testing::AppTester;

    fn ready_model() -> Model {
        Model {
            nutrition: NutritionTable::from_json_str(
                r#"[{ "label": "apple", "name": "Apple", "calories_per_100g": 52, "portion_grams": 180 }]"#,
            )
            .unwrap(),
            history: Some(HistoryStore::open_in_memory().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn every_event_renders() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        let update = app.update(Event::ErrorDismissed, &mut model);
        assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));
    }

    #[test]
    fn manual_staging_and_save() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();

        app.update(
            Event::ManualItemAdded {
                label: "Apple".into(),
                grams: Some(100.0),
            },
            &mut model,
        );
        app.update(
            Event::CustomItemAdded {
                name: "Toast".into(),
                calories_per_100g: 260.0,
                grams: 50.0,
            },
            &mut model,
        );
        assert_eq!(model.staged_total(), 52 + 130);
        assert_eq!(model.staged[0].source, FoodSource::Manual);

        app.update(
            Event::MealSessionSelected {
                session: MealSession::Breakfast,
            },
            &mut model,
        );
        app.update(Event::MealSaved, &mut model);

        assert!(model.active_error.is_none());
        assert!(model.staged.is_empty());
        assert_eq!(model.day_entries.len(), 1);
        assert_eq!(model.day_entries[0].session, MealSession::Breakfast);
        assert_eq!(app.view(&model).consumed_calories, 182);
    }

    #[test]
    fn saving_empty_meal_is_rejected() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();
        app.update(Event::MealSaved, &mut model);
        assert_eq!(model.active_error.as_ref().unwrap().kind, ErrorKind::Validation);

        app.update(Event::ErrorDismissed, &mut model);
        assert!(app.view(&model).error.is_none());
    }

    #[test]
    fn unknown_food_and_bad_index_surface_errors() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();

        app.update(
            Event::ManualItemAdded {
                label: "pizza".into(),
                grams: None,
            },
            &mut model,
        );
        assert_eq!(model.active_error.as_ref().unwrap().kind, ErrorKind::NutritionLookup);

        app.update(Event::StagedItemRemoved { index: 3 }, &mut model);
        assert_eq!(model.active_error.as_ref().unwrap().kind, ErrorKind::Validation);
    }

    #[test]
    fn portion_change_recomputes_item() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();
        app.update(
            Event::ManualItemAdded {
                label: "apple".into(),
                grams: None,
            },
            &mut model,
        );
        app.update(Event::StagedItemPortionChanged { index: 0, grams: 200.0 }, &mut model);
        assert_eq!(model.staged[0].calories, 104);

        app.update(Event::StagedItemPortionChanged { index: 0, grams: -1.0 }, &mut model);
        assert_eq!(model.staged[0].calories, 104);
        assert!(model.active_error.is_some());
    }

    #[test]
    fn photo_without_detector_reports_unavailable() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();
        app.update(
            Event::PhotoCaptured {
                bytes: crate::imaging::tests::create_test_png(16, 16),
            },
            &mut model,
        );
        let view = app.view(&model);
        assert!(!view.detector_available);
        assert_eq!(view.error.unwrap().code, "DETECTOR_UNAVAILABLE");
        assert!(view.detections.is_empty());
    }

    #[test]
    fn live_frames_ignored_unless_enabled() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();
        app.update(
            Event::LiveFrameReceived {
                rgb: vec![0; 12],
                width: 2,
                height: 2,
                timestamp_ms: 0,
            },
            &mut model,
        );
        assert!(model.active_error.is_none());

        app.update(Event::LiveDetectionToggled { enabled: true }, &mut model);
        app.update(
            Event::LiveFrameReceived {
                rgb: vec![0; 12],
                width: 2,
                height: 2,
                timestamp_ms: 0,
            },
            &mut model,
        );
        // unavailable detector switches live mode back off
        assert!(!model.live_detection);
        assert_eq!(model.active_error.as_ref().unwrap().kind, ErrorKind::DetectorUnavailable);
    }

    #[test]
    fn profile_drives_daily_target() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();
        let profile = UserProfile {
            sex: Sex::Male,
            age_years: 30,
            height_cm: 180.0,
            weight_kg: 80.0,
            activity: ActivityLevel::Moderate,
            goal: WeightGoal::Maintain,
        };
        app.update(Event::ProfileUpdated { profile }, &mut model);
        let view = app.view(&model);
        assert_eq!(view.daily_target, Some(2759));
        assert_eq!(view.remaining_calories, Some(2759));

        let invalid = UserProfile {
            age_years: 4,
            ..model.profile.clone().unwrap()
        };
        app.update(Event::ProfileUpdated { profile: invalid }, &mut model);
        assert_eq!(model.profile.as_ref().unwrap().age_years, 30);
        assert_eq!(model.active_error.as_ref().unwrap().kind, ErrorKind::Validation);
    }

    #[test]
    fn closing_releases_detector_and_history() {
        let app = AppTester::<App, Effect>::default();
        let mut model = ready_model();
        app.update(Event::AppClosing, &mut model);
        assert!(model.closed);
        assert!(model.history.is_none());
        assert_eq!(model.detector.status(), DetectorStatus::Closed);

        app.update(Event::AppStarted { config: AppConfig::default() }, &mut model);
        assert_eq!(model.active_error.as_ref().unwrap().kind, ErrorKind::InvalidState);
    }
}
