use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest daily target we ever suggest.
pub const MIN_DAILY_CALORIES: u32 = 1_200;

pub const AGE_RANGE: std::ops::RangeInclusive<u32> = 13..=120;
pub const HEIGHT_CM_RANGE: std::ops::RangeInclusive<f32> = 100.0..=250.0;
pub const WEIGHT_KG_RANGE: std::ops::RangeInclusive<f32> = 30.0..=300.0;

#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("age {0} is outside 13..=120 years")]
    Age(u32),

    #[error("height {0} cm is outside 100..=250")]
    Height(f32),

    #[error("weight {0} kg is outside 30..=300")]
    Weight(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    #[default]
    Sedentary,
    Light,
    Moderate,
    Active,
    VeryActive,
}

impl ActivityLevel {
    #[must_use]
    pub const fn factor(self) -> f32 {
        match self {
            Self::Sedentary => 1.2,
            Self::Light => 1.375,
            Self::Moderate => 1.55,
            Self::Active => 1.725,
            Self::VeryActive => 1.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightGoal {
    Lose,
    #[default]
    Maintain,
    Gain,
}

impl WeightGoal {
    #[must_use]
    pub const fn adjustment_kcal(self) -> f32 {
        match self {
            Self::Lose => -500.0,
            Self::Maintain => 0.0,
            Self::Gain => 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub sex: Sex,
    pub age_years: u32,
    pub height_cm: f32,
    pub weight_kg: f32,
    #[serde(default)]
    pub activity: ActivityLevel,
    #[serde(default)]
    pub goal: WeightGoal,
}

impl UserProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if !AGE_RANGE.contains(&self.age_years) {
            return Err(ProfileError::Age(self.age_years));
        }
        if !self.height_cm.is_finite() || !HEIGHT_CM_RANGE.contains(&self.height_cm) {
            return Err(ProfileError::Height(self.height_cm));
        }
        if !self.weight_kg.is_finite() || !WEIGHT_KG_RANGE.contains(&self.weight_kg) {
            return Err(ProfileError::Weight(self.weight_kg));
        }
        Ok(())
    }

    /// Mifflin-St Jeor basal metabolic rate in kcal/day.
    #[must_use]
    pub fn bmr(&self) -> f32 {
        let base = 10.0 * self.weight_kg + 6.25 * self.height_cm - 5.0 * self.age_years as f32;
        match self.sex {
            Sex::Male => base + 5.0,
            Sex::Female => base - 161.0,
        }
    }

    #[must_use]
    pub fn tdee(&self) -> f32 {
        self.bmr() * self.activity.factor()
    }

    /// Whole kcal per day after the goal adjustment, never below [`MIN_DAILY_CALORIES`].
    pub fn daily_calorie_target(&self) -> Result<u32, ProfileError> {
        self.validate()?;
        let target = (self.tdee() + self.goal.adjustment_kcal()).round();
        Ok((target.max(0.0) as u32).max(MIN_DAILY_CALORIES))
    }
}
