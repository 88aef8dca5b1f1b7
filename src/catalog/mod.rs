//! Fashion-model catalog: the stock model roster the try-on pipeline selects
//! from, plus the telemetry the pipeline writes back after each attempt.

pub mod memory;
pub mod supabase;

pub use memory::InMemoryCatalog;
pub use supabase::SupabaseCatalog;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{collections::BTreeSet, fmt};
use thiserror::Error;

/// Tumbling window for `recent_usage`, in days.
pub const RECENT_USAGE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[serde(alias = "male", alias = "man")]
    Men,
    #[serde(alias = "female", alias = "woman")]
    Women,
    Unisex,
}

impl Gender {
    /// Normalizes loose caller input. Unknown or empty input targets unisex.
    pub fn from_loose(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "men" | "man" | "male" | "m" | "mens" | "men's" | "boys" => Gender::Men,
            "women" | "woman" | "female" | "f" | "womens" | "women's" | "ladies" | "girls" => {
                Gender::Women
            }
            _ => Gender::Unisex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Men => "men",
            Gender::Women => "women",
            Gender::Unisex => "unisex",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    #[default]
    General,
    Formal,
    Casual,
    Athletic,
    Evening,
}

impl ModelCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::General => "general",
            ModelCategory::Formal => "formal",
            ModelCategory::Casual => "casual",
            ModelCategory::Athletic => "athletic",
            ModelCategory::Evening => "evening",
        }
    }
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FashionModel {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub body_type: Option<String>,
    pub ethnicity: Option<String>,
    pub age_range: Option<String>,
    pub pose: Option<String>,
    #[serde(default)]
    pub category: ModelCategory,
    pub height: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    /// Opaque reference into whichever media host stores the original upload.
    pub storage_ref: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(flatten)]
    pub telemetry: ModelTelemetry,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl FashionModel {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        gender: Gender,
        category: ModelCategory,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            gender,
            body_type: None,
            ethnicity: None,
            age_range: None,
            pose: None,
            category,
            height: None,
            tags: BTreeSet::new(),
            image_url: image_url.into(),
            thumbnail_url: None,
            storage_ref: None,
            is_active: true,
            is_featured: false,
            sort_order: 0,
            telemetry: ModelTelemetry::default(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Counters mutated only by the try-on pipeline. Last write wins.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTelemetry {
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub recent_usage: u64,
    pub recent_window_started_at: Option<DateTime<Utc>>,
    /// Percentage (0-100) of try-on attempts that completed.
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub total_interactions: u64,
    #[serde(default)]
    pub tryon_attempts: u64,
    #[serde(default)]
    pub tryon_successes: u64,
    pub avg_processing_ms: Option<f64>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ModelTelemetry {
    /// Recent usage as seen at `now`; an elapsed window reads as zero.
    pub fn recent_usage_at(&self, now: DateTime<Utc>) -> u64 {
        match self.recent_window_started_at {
            Some(start) if now.signed_duration_since(start) >= recent_window() => 0,
            _ => self.recent_usage,
        }
    }

    pub fn apply_usage(&mut self, now: DateTime<Utc>) {
        self.roll_window(now);
        self.usage_count += 1;
        self.recent_usage += 1;
        self.total_interactions += 1;
        self.last_used_at = Some(now);
    }

    /// One try-on attempt: the usage bump plus the success tally and a
    /// processing-time sample.
    pub fn apply_outcome(&mut self, succeeded: bool, processing_ms: u64, now: DateTime<Utc>) {
        self.seed_legacy_tally();
        self.apply_usage(now);
        self.tryon_attempts += 1;
        if succeeded {
            self.tryon_successes += 1;
        }
        let rate = self.tryon_successes as f64 * 100.0 / self.tryon_attempts as f64;
        self.success_rate = (rate * 100.0).round() / 100.0;

        let sample = processing_ms as f64;
        self.avg_processing_ms = Some(match self.avg_processing_ms {
            Some(prev) => prev + (sample - prev) / self.tryon_attempts as f64,
            None => sample,
        });
    }

    /// Rows written before attempts were tallied carry only a rate and a
    /// usage count. Rebuild the tally from those so the stored rate keeps
    /// its weight.
    fn seed_legacy_tally(&mut self) {
        if self.tryon_attempts > 0 || self.usage_count == 0 || self.success_rate <= 0.0 {
            return;
        }
        let rate = self.success_rate.clamp(0.0, 100.0);
        self.tryon_attempts = self.usage_count;
        self.tryon_successes = (rate * self.usage_count as f64 / 100.0).round() as u64;
    }

    fn roll_window(&mut self, now: DateTime<Utc>) {
        match self.recent_window_started_at {
            Some(start) if now.signed_duration_since(start) < recent_window() => {}
            Some(_) => {
                self.recent_usage = 0;
                self.recent_window_started_at = Some(now);
            }
            None => self.recent_window_started_at = Some(now),
        }
    }
}

fn recent_window() -> TimeDelta {
    TimeDelta::days(RECENT_USAGE_WINDOW_DAYS)
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("fashion model `{0}` not found")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Active models ordered by `sort_order` ascending, newest first on ties.
    async fn list_active(&self) -> Result<Vec<FashionModel>, CatalogError>;

    /// Any record, active or not.
    async fn get(&self, id: &str) -> Result<FashionModel, CatalogError>;

    async fn record_usage(&self, id: &str) -> Result<(), CatalogError>;

    async fn record_outcome(
        &self,
        id: &str,
        succeeded: bool,
        processing_ms: u64,
    ) -> Result<(), CatalogError>;
}

pub(crate) fn sort_for_selection(models: &mut [FashionModel]) {
    models.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}
