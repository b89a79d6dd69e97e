use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Issue name the classifier uses for uploads it refuses to treat as a
/// real photograph of a plant.
pub const INVALID_IMAGE_ISSUE: &str = "Invalid Image";

/// Structured diagnosis produced by the classifier. Immutable once built;
/// the classifier client validates every field before constructing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub is_healthy: bool,
    pub issue_name: String,
    pub description: String,
    pub recommendations: Vec<String>,
}

impl AnalysisResult {
    pub fn is_rejected_image(&self) -> bool {
        self.issue_name == INVALID_IMAGE_ISSUE
    }
}

/// One completed analysis, handed to the history sink and never mutated
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisEvent {
    pub id: String,
    pub result: AnalysisResult,
    /// Display reference for the analyzed image: a data URL for uploads,
    /// the fetch URL for live captures.
    pub image: String,
    /// Completion time, strictly increasing within a session.
    pub timestamp: DateTime<Utc>,
}

/// Synthetic environment reading shown alongside live captures.
/// Regenerated on every cycle, superseded by the next one, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    pub temperature: f64,
    pub humidity: i64,
    pub light: i64,
}

impl SensorSample {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self {
            temperature: (rng.gen_range(20.0..=25.0_f64) * 10.0).round() / 10.0,
            humidity: rng.gen_range(50..=70),
            light: rng.gen_range(10_000..=15_000),
        }
    }
}
