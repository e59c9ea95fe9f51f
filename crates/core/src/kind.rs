//! Job kinds and their per-kind execution settings.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::retry::RetryPolicy;

/// Kind of analysis a job performs; selects the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Medical exam document analysis (OCR + LLM read-out).
    ExamAnalysis,
    /// Meal photo recognition.
    FoodImageAnalysis,
    /// Nutritional computation over a list of foods.
    NutritionCalculation,
    /// Long-form report generation.
    MedicalReport,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ExamAnalysis,
        JobKind::FoodImageAnalysis,
        JobKind::NutritionCalculation,
        JobKind::MedicalReport,
    ];

    /// Stable wire/storage tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ExamAnalysis => "exam_analysis",
            JobKind::FoodImageAnalysis => "food_image_analysis",
            JobKind::NutritionCalculation => "nutrition_calculation",
            JobKind::MedicalReport => "medical_report",
        }
    }

    /// Built-in execution settings for this kind.
    pub fn default_settings(&self) -> KindSettings {
        match self {
            JobKind::ExamAnalysis => KindSettings {
                max_attempts: 3,
                estimated_duration: Duration::from_secs(90),
                timeout: Duration::from_secs(120),
                default_priority: 5,
                retry: RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(300)),
            },
            JobKind::FoodImageAnalysis => KindSettings {
                max_attempts: 3,
                estimated_duration: Duration::from_secs(30),
                timeout: Duration::from_secs(60),
                default_priority: 3,
                retry: RetryPolicy::exponential(Duration::from_secs(2), Duration::from_secs(120)),
            },
            JobKind::NutritionCalculation => KindSettings {
                max_attempts: 5,
                estimated_duration: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
                default_priority: 1,
                retry: RetryPolicy::linear(Duration::from_secs(1), Duration::from_secs(30)),
            },
            JobKind::MedicalReport => KindSettings {
                max_attempts: 3,
                estimated_duration: Duration::from_secs(120),
                timeout: Duration::from_secs(180),
                default_priority: 7,
                retry: RetryPolicy::exponential(Duration::from_secs(10), Duration::from_secs(600)),
            },
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unsupported job type: {s}")))
    }
}

/// Execution settings for one job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSettings {
    /// Attempts allowed before the job fails (>= 1).
    pub max_attempts: u32,
    /// Expected analyzer duration; drives stuck-job detection.
    pub estimated_duration: Duration,
    /// Hard limit on a single analyzer call.
    pub timeout: Duration,
    /// Priority used when the caller does not supply one (lower = sooner).
    pub default_priority: i32,
    /// Backoff between attempts.
    pub retry: RetryPolicy,
}

/// Settings for every [`JobKind`]; total by construction.
#[derive(Debug, Clone)]
pub struct KindSettingsMap {
    settings: HashMap<JobKind, KindSettings>,
}

impl Default for KindSettingsMap {
    fn default() -> Self {
        Self {
            settings: JobKind::ALL
                .into_iter()
                .map(|k| (k, k.default_settings()))
                .collect(),
        }
    }
}

impl KindSettingsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: JobKind) -> &KindSettings {
        // Every kind is inserted by `default()` and `set` only replaces.
        &self.settings[&kind]
    }

    /// Replace the settings of one kind. `max_attempts` is clamped to >= 1.
    pub fn set(&mut self, kind: JobKind, mut settings: KindSettings) {
        settings.max_attempts = settings.max_attempts.max(1);
        self.settings.insert(kind, settings);
    }

    /// Builder-style variant of [`KindSettingsMap::set`].
    pub fn with(mut self, kind: JobKind, settings: KindSettings) -> Self {
        self.set(kind, settings);
        self
    }

    pub fn update(&mut self, kind: JobKind, f: impl FnOnce(&mut KindSettings)) {
        let mut settings = self.get(kind).clone();
        f(&mut settings);
        self.set(kind, settings);
    }
}
