use crate::catalog::FashionModel;
use crate::outcome::OutcomeTier;
use crate::selector::ScoreBreakdown;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct TryOnRequest {
    /// Remote URL or `data:image/...;base64,` payload.
    pub garment_image: String,
    #[serde(default)]
    pub garment_category: String,
    /// Loose input: `men`, `female`, `unisex`, ...
    #[serde(default)]
    pub gender: String,
    /// Bypasses selection.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub background_removed_image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TryOnResponse {
    pub success: bool,
    pub processed_image_url: String,
    pub message: String,
    pub tier: OutcomeTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectModelRequest {
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub garment_category: String,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SelectModelResponse {
    pub mapped_category: String,
    pub gender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<FashionModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordOutcomeRequest {
    pub succeeded: bool,
    #[serde(default)]
    pub processing_time_ms: u64,
}
