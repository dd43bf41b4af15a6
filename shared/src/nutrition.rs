use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::detection::Detection;
use crate::MAX_PORTION_GRAMS;

/// Energy density ceiling; pure fat sits near 900 kcal/100 g.
pub const MAX_CALORIES_PER_100G: f32 = 1_000.0;

#[derive(Debug, Error)]
pub enum NutritionError {
    #[error("failed to read nutrition table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid nutrition table json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate food label: {0}")]
    DuplicateLabel(String),

    #[error("invalid record for {label}: {reason}")]
    InvalidRecord { label: String, reason: String },

    #[error("no nutrition data for {0}")]
    UnknownFood(String),

    #[error("invalid portion: {0} g")]
    InvalidPortion(f32),
}

/// Lower-cases and trims a label, mapping spaces and hyphens to `_`.
#[must_use]
pub fn normalize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodNutrition {
    pub label: String,
    pub name: String,
    pub calories_per_100g: f32,
    pub portion_grams: f32,
}

impl FoodNutrition {
    fn validate(&self) -> Result<(), NutritionError> {
        let invalid = |reason: &str| NutritionError::InvalidRecord {
            label: self.label.clone(),
            reason: reason.to_string(),
        };
        if self.label.is_empty() {
            return Err(invalid("empty label"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("empty name"));
        }
        if !density_in_range(self.calories_per_100g) {
            return Err(invalid("calories_per_100g must be between 0 and 1000"));
        }
        if !self.portion_grams.is_finite() || self.portion_grams <= 0.0 {
            return Err(invalid("portion_grams must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn portion_calories(&self) -> u32 {
        calories_for(self.calories_per_100g, self.portion_grams)
    }
}

fn calories_for(calories_per_100g: f32, grams: f32) -> u32 {
    (calories_per_100g * grams / 100.0).round().max(0.0) as u32
}

fn density_in_range(calories_per_100g: f32) -> bool {
    calories_per_100g.is_finite() && (0.0..=MAX_CALORIES_PER_100G).contains(&calories_per_100g)
}

fn check_portion(grams: f32) -> Result<(), NutritionError> {
    if grams.is_finite() && grams > 0.0 && grams <= MAX_PORTION_GRAMS {
        Ok(())
    } else {
        Err(NutritionError::InvalidPortion(grams))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FoodSource {
    Detected { confidence: f32 },
    Manual,
}

/// One line of a meal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodItem {
    pub label: String,
    pub display_name: String,
    pub grams: f32,
    pub calories_per_100g: f32,
    pub calories: u32,
    pub source: FoodSource,
}

impl FoodItem {
    /// Changes the portion and recomputes calories.
    pub fn set_grams(&mut self, grams: f32) -> Result<(), NutritionError> {
        check_portion(grams)?;
        self.grams = grams;
        self.calories = calories_for(self.calories_per_100g, grams);
        Ok(())
    }

    /// Rejects items edited outside [`FoodItem::set_grams`] into impossible values.
    pub fn check(&self) -> Result<(), NutritionError> {
        check_portion(self.grams)?;
        let invalid = |reason: String| NutritionError::InvalidRecord {
            label: self.label.clone(),
            reason,
        };
        if !density_in_range(self.calories_per_100g) {
            return Err(invalid(format!("{} kcal/100 g is out of range", self.calories_per_100g)));
        }
        let ceiling = calories_for(MAX_CALORIES_PER_100G, self.grams);
        if self.calories > ceiling {
            return Err(invalid(format!("{} kcal exceeds {ceiling} kcal for {} g", self.calories, self.grams)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MealEstimate {
    pub items: Vec<FoodItem>,
    /// Detected labels with no table entry, first-seen order.
    pub unmatched_labels: Vec<String>,
    pub total_calories: u32,
}

/// Sum of item calories, saturating at `u32::MAX` for edited entries with absurd values.
#[must_use]
pub fn total_calories(items: &[FoodItem]) -> u32 {
    items
        .iter()
        .fold(0u32, |total, item| total.saturating_add(item.calories))
}

/// Read-only label → nutrition lookup, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct NutritionTable {
    foods: HashMap<String, FoodNutrition>,
}

impl NutritionTable {
    pub fn from_json_str(raw: &str) -> Result<Self, NutritionError> {
        let records: Vec<FoodNutrition> = serde_json::from_str(raw)?;
        let mut foods = HashMap::with_capacity(records.len());
        for mut record in records {
            record.label = normalize_label(&record.label);
            record.validate()?;
            if foods.contains_key(&record.label) {
                return Err(NutritionError::DuplicateLabel(record.label));
            }
            foods.insert(record.label.clone(), record);
        }
        debug!(foods = foods.len(), "nutrition table loaded");
        Ok(Self { foods })
    }

    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, NutritionError> {
        let raw = std::fs::read_to_string(path).map_err(|source| NutritionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.foods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.foods.is_empty()
    }

    #[must_use]
    pub fn lookup(&self, label: &str) -> Option<&FoodNutrition> {
        self.foods.get(&normalize_label(label))
    }

    /// Foods sorted by display name, for manual entry pickers.
    #[must_use]
    pub fn foods(&self) -> Vec<&FoodNutrition> {
        let mut foods: Vec<_> = self.foods.values().collect();
        foods.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.label.cmp(&b.label)));
        foods
    }

    /// One standard portion per detection.
    #[instrument(skip(self, detections), fields(detections = detections.len()))]
    pub fn estimate_meal(&self, detections: &[Detection]) -> MealEstimate {
        let mut items = Vec::with_capacity(detections.len());
        let mut unmatched_labels = Vec::new();
        let mut seen_unmatched = HashSet::new();

        for detection in detections {
            match self.lookup(&detection.label) {
                Some(food) => items.push(FoodItem {
                    label: food.label.clone(),
                    display_name: food.name.clone(),
                    grams: food.portion_grams,
                    calories_per_100g: food.calories_per_100g,
                    calories: food.portion_calories(),
                    source: FoodSource::Detected {
                        confidence: detection.confidence,
                    },
                }),
                None => {
                    if seen_unmatched.insert(detection.label.clone()) {
                        debug!(label = %detection.label, "no nutrition data for detected label");
                        unmatched_labels.push(detection.label.clone());
                    }
                }
            }
        }

        let total_calories = total_calories(&items);
        MealEstimate {
            items,
            unmatched_labels,
            total_calories,
        }
    }

    /// A known food entered by hand; `grams` defaults to the standard portion.
    pub fn manual_item(&self, label: &str, grams: Option<f32>) -> Result<FoodItem, NutritionError> {
        let food = self
            .lookup(label)
            .ok_or_else(|| NutritionError::UnknownFood(label.to_string()))?;
        let grams = grams.unwrap_or(food.portion_grams);
        check_portion(grams)?;
        Ok(FoodItem {
            label: food.label.clone(),
            display_name: food.name.clone(),
            grams,
            calories_per_100g: food.calories_per_100g,
            calories: calories_for(food.calories_per_100g, grams),
            source: FoodSource::Manual,
        })
    }

    /// A free-form food that is not in the table.
    pub fn custom_item(name: &str, calories_per_100g: f32, grams: f32) -> Result<FoodItem, NutritionError> {
        let display_name = name.trim();
        let record = FoodNutrition {
            label: normalize_label(display_name),
            name: display_name.to_string(),
            calories_per_100g,
            portion_grams: grams,
        };
        record.validate()?;
        check_portion(grams)?;
        Ok(FoodItem {
            calories: record.portion_calories(),
            label: record.label,
            display_name: record.name,
            grams,
            calories_per_100g,
            source: FoodSource::Manual,
        })
    }
}
