//! Confidence classification for accuracy metrics.
//!
//! A metric cell's reliability is judged by the number of days its sample
//! spans, not by raw sample count: < 30 days is insufficient, 30–89 days
//! preliminary, 90+ validated. The classification is monotone
//! non-decreasing in days of data.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Days of data needed to leave `Insufficient`.
pub const PRELIMINARY_THRESHOLD_DAYS: i64 = 30;
/// Days of data needed to reach `Validated`.
pub const VALIDATED_THRESHOLD_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Insufficient,
    Preliminary,
    Validated,
}

impl ConfidenceLevel {
    pub fn from_days_of_data(days: i64) -> Self {
        if days < PRELIMINARY_THRESHOLD_DAYS {
            ConfidenceLevel::Insufficient
        } else if days < VALIDATED_THRESHOLD_DAYS {
            ConfidenceLevel::Preliminary
        } else {
            ConfidenceLevel::Validated
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceLevel::Insufficient => "insufficient",
            ConfidenceLevel::Preliminary => "preliminary",
            ConfidenceLevel::Validated => "validated",
        }
    }
}

/// Metadata about a cell's confidence, for UI display.
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceAssessment {
    pub level: ConfidenceLevel,
    pub sample_size: usize,
    pub days_of_data: i64,
    pub label: &'static str,
    pub show_warning: bool,
}

/// Evaluate confidence from the sample size and the time range it spans.
pub fn evaluate_confidence(
    sample_size: usize,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
) -> ConfidenceAssessment {
    let days_of_data = (latest - earliest).num_days();
    let level = ConfidenceLevel::from_days_of_data(days_of_data);

    let (label, show_warning) = match level {
        ConfidenceLevel::Insufficient => ("Insufficient Data", true),
        ConfidenceLevel::Preliminary => ("Preliminary", true),
        ConfidenceLevel::Validated => ("Validated", false),
    };

    ConfidenceAssessment {
        level,
        sample_size,
        days_of_data,
        label,
        show_warning,
    }
}

/// Human-readable explanation with a remaining-days hint.
pub fn confidence_message(assessment: &ConfidenceAssessment) -> String {
    match assessment.level {
        ConfidenceLevel::Insufficient => {
            let remaining = PRELIMINARY_THRESHOLD_DAYS - assessment.days_of_data;
            format!(
                "Insufficient data ({} days). Collect {} more {} to reach preliminary status.",
                assessment.days_of_data,
                remaining,
                day_word(remaining),
            )
        }
        ConfidenceLevel::Preliminary => {
            let remaining = VALIDATED_THRESHOLD_DAYS - assessment.days_of_data;
            format!(
                "Results based on {} days of data. Metrics will stabilize after {} more {}.",
                assessment.days_of_data,
                remaining,
                day_word(remaining),
            )
        }
        ConfidenceLevel::Validated => format!(
            "Validated with {} days of data. These metrics are statistically reliable.",
            assessment.days_of_data,
        ),
    }
}

fn day_word(n: i64) -> &'static str {
    if n == 1 {
        "day"
    } else {
        "days"
    }
}
