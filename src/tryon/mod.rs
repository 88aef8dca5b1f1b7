//! Virtual try-on: the provider seam, the FASHN client and the polling
//! orchestrator.

pub mod fashn;
pub mod orchestrator;

pub use fashn::FashnClient;
pub use orchestrator::{JobRun, Orchestrator};

use crate::selector::{label_words, mentions_any};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("submission rejected: {0}")]
    Submission(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TryOnSubmission {
    pub model_image: String,
    pub garment_image: String,
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    /// Anything the provider reports that is not terminal counts as pending.
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "completed" | "succeeded" => JobStatus::Completed,
            "failed" | "canceled" | "cancelled" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStatus {
    pub status: JobStatus,
    pub output: Vec<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait TryOnProvider: Send + Sync {
    /// Returns the provider-assigned job id.
    async fn submit(&self, submission: &TryOnSubmission) -> Result<String, ProviderError>;

    async fn status(&self, job_id: &str) -> Result<ProviderStatus, ProviderError>;
}

const ONE_PIECE_KEYWORDS: &[&str] = &["dress", "gown", "jumpsuit", "romper", "overall", "onesie"];
const BOTTOM_KEYWORDS: &[&str] = &[
    "jeans", "trouser", "pants", "skirt", "shorts", "leggings", "chinos", "joggers",
];
const TOP_KEYWORDS: &[&str] = &[
    "shirt", "blouse", "jacket", "hoodie", "sweater", "top", "tee", "blazer", "coat", "cardigan",
    "jersey",
];

/// Garment label to the provider's `inputs.category` vocabulary.
pub fn provider_category(label: &str) -> &'static str {
    let words = label_words(label);
    let has_any = |keywords: &[&str]| mentions_any(&words, keywords);
    if has_any(&["dress shirt"]) {
        "tops"
    } else if has_any(ONE_PIECE_KEYWORDS) {
        "one-pieces"
    } else if has_any(BOTTOM_KEYWORDS) {
        "bottoms"
    } else if has_any(TOP_KEYWORDS) {
        "tops"
    } else {
        "auto"
    }
}
