//! Fallback tiers and the metrics write-back that follows every try-on attempt.

use crate::catalog::ModelCatalog;
use crate::tryon::JobRun;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTier {
    TryOn,
    BackgroundRemoved,
    Original,
}

impl OutcomeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeTier::TryOn => "try_on",
            OutcomeTier::BackgroundRemoved => "background_removed",
            OutcomeTier::Original => "original",
        }
    }
}

/// The pre-try-on image returned whenever try-on does not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackImage {
    pub url: String,
    pub background_removed: bool,
}

impl FallbackImage {
    pub fn tier(&self) -> OutcomeTier {
        if self.background_removed {
            OutcomeTier::BackgroundRemoved
        } else {
            OutcomeTier::Original
        }
    }

    fn describe(&self) -> &'static str {
        if self.background_removed {
            "background-removed image"
        } else {
            "original image"
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TryOnOutcome {
    Completed { url: String },
    Degraded { fallback: FallbackImage, reason: String },
    Skipped { fallback: FallbackImage, reason: String },
}

impl TryOnOutcome {
    pub fn image_url(&self) -> &str {
        match self {
            TryOnOutcome::Completed { url } => url,
            TryOnOutcome::Degraded { fallback, .. } | TryOnOutcome::Skipped { fallback, .. } => {
                &fallback.url
            }
        }
    }

    pub fn tier(&self) -> OutcomeTier {
        match self {
            TryOnOutcome::Completed { .. } => OutcomeTier::TryOn,
            TryOnOutcome::Degraded { fallback, .. } | TryOnOutcome::Skipped { fallback, .. } => {
                fallback.tier()
            }
        }
    }

    pub fn message(&self) -> String {
        match self {
            TryOnOutcome::Completed { .. } => "Virtual try-on completed".to_string(),
            TryOnOutcome::Degraded { fallback, reason } => {
                format!("{reason}; returning the {}", fallback.describe())
            }
            TryOnOutcome::Skipped { fallback, reason } => {
                format!("Virtual try-on skipped: {reason}; returning the {}", fallback.describe())
            }
        }
    }

    pub fn skipped(fallback: FallbackImage, reason: impl Into<String>) -> Self {
        TryOnOutcome::Skipped {
            fallback,
            reason: reason.into(),
        }
    }
}

/// Turns an orchestrator result into the final image and writes exactly one
/// telemetry update for the model that was tried. Never fails.
#[derive(Clone)]
pub struct OutcomeRecorder {
    catalog: Arc<dyn ModelCatalog>,
}

impl OutcomeRecorder {
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn settle(
        &self,
        run: &JobRun,
        model_id: &str,
        fallback: FallbackImage,
        elapsed: Duration,
    ) -> TryOnOutcome {
        let elapsed_ms = elapsed.as_millis() as u64;
        let outcome = match run {
            JobRun::Completed { output_url, .. } => {
                self.record(model_id, true, elapsed_ms).await;
                TryOnOutcome::Completed {
                    url: output_url.clone(),
                }
            }
            JobRun::Failed { error, .. } => {
                self.record(model_id, false, elapsed_ms).await;
                TryOnOutcome::Degraded {
                    fallback,
                    reason: format!("Virtual try-on failed: {error}"),
                }
            }
            JobRun::TimedOut { polls, .. } => {
                self.record(model_id, false, elapsed_ms).await;
                TryOnOutcome::Degraded {
                    fallback,
                    reason: format!("Virtual try-on timed out after {polls} status checks"),
                }
            }
            JobRun::Cancelled { .. } => TryOnOutcome::Degraded {
                fallback,
                reason: "Virtual try-on was cancelled".into(),
            },
        };

        crate::metrics::tryon_outcome(outcome.tier().as_str());
        info!(
            target = "thrift.outcome",
            model_id = model_id,
            job_id = run.job_id().unwrap_or("-"),
            tier = outcome.tier().as_str(),
            elapsed_ms = elapsed_ms,
            "tryon_settled"
        );
        outcome
    }

    async fn record(&self, model_id: &str, succeeded: bool, elapsed_ms: u64) {
        if let Err(err) = self
            .catalog
            .record_outcome(model_id, succeeded, elapsed_ms)
            .await
        {
            warn!(
                target = "thrift.outcome",
                model_id = model_id,
                error = %err,
                "catalog_write_failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FashionModel, Gender, InMemoryCatalog, ModelCategory};

    fn fallback() -> FallbackImage {
        FallbackImage {
            url: "https://cdn.example/nobg.png".into(),
            background_removed: true,
        }
    }

    fn recorder() -> (OutcomeRecorder, Arc<InMemoryCatalog>) {
        let catalog = Arc::new(InMemoryCatalog::new([FashionModel::new(
            "m1",
            "Ada",
            Gender::Women,
            ModelCategory::Casual,
            "https://cdn.example/m1.jpg",
        )]));
        (OutcomeRecorder::new(catalog.clone()), catalog)
    }

    #[tokio::test]
    async fn completed_records_success() {
        let (recorder, catalog) = recorder();
        let run = JobRun::Completed {
            job_id: "j".into(),
            output_url: "https://cdn/x.jpg".into(),
            polls: 1,
        };
        let outcome = recorder
            .settle(&run, "m1", fallback(), Duration::from_millis(4200))
            .await;
        assert_eq!(outcome.image_url(), "https://cdn/x.jpg");
        assert_eq!(outcome.tier(), OutcomeTier::TryOn);

        let t = catalog.get("m1").await.unwrap().telemetry;
        assert_eq!((t.usage_count, t.tryon_successes, t.tryon_attempts), (1, 1, 1));
        assert_eq!(t.avg_processing_ms, Some(4200.0));
    }

    #[tokio::test]
    async fn timeout_degrades_and_records_failure() {
        let (recorder, catalog) = recorder();
        let run = JobRun::TimedOut {
            job_id: "j".into(),
            polls: 15,
        };
        let outcome = recorder
            .settle(&run, "m1", fallback(), Duration::from_secs(60))
            .await;
        assert_eq!(outcome.image_url(), "https://cdn.example/nobg.png");
        assert_eq!(outcome.tier(), OutcomeTier::BackgroundRemoved);
        assert!(outcome.message().contains("timed out"));

        let t = catalog.get("m1").await.unwrap().telemetry;
        assert_eq!((t.usage_count, t.tryon_successes, t.tryon_attempts), (1, 0, 1));
    }

    #[tokio::test]
    async fn cancelled_attempt_is_not_counted() {
        let (recorder, catalog) = recorder();
        let run = JobRun::Cancelled {
            job_id: Some("j".into()),
        };
        recorder
            .settle(&run, "m1", fallback(), Duration::from_secs(3))
            .await;
        assert_eq!(catalog.get("m1").await.unwrap().telemetry.usage_count, 0);
    }

    #[tokio::test]
    async fn catalog_errors_are_absorbed() {
        let (recorder, _) = recorder();
        let run = JobRun::Failed {
            job_id: None,
            error: "boom".into(),
        };
        let outcome = recorder
            .settle(&run, "ghost", fallback(), Duration::from_secs(1))
            .await;
        assert!(outcome.message().contains("failed: boom"));
    }

    #[test]
    fn skipped_message_names_the_fallback() {
        let outcome = TryOnOutcome::skipped(
            FallbackImage {
                url: "https://cdn.example/orig.jpg".into(),
                background_removed: false,
            },
            "no active fashion models",
        );
        assert_eq!(outcome.tier(), OutcomeTier::Original);
        assert_eq!(
            outcome.message(),
            "Virtual try-on skipped: no active fashion models; returning the original image"
        );
    }
}
