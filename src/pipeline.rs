use crate::bgremove::BackgroundRemover;
use crate::catalog::{CatalogError, FashionModel, Gender, ModelCatalog};
use crate::models::{StageReport, TryOnRequest, TryOnResponse};
use crate::outcome::{FallbackImage, OutcomeRecorder, TryOnOutcome};
use crate::selector::{self, RankedModel, ScoringWeights};
use crate::storage::ObjectStore;
use crate::transfer::{ImageFormat, ImagePurpose, ImageTransfer, TransferError};
use crate::tryon::{Orchestrator, provider_category};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Composition of selector, transfer adapter, orchestrator and recorder for a
/// single try-on request. Cheap to clone.
#[derive(Clone)]
pub struct TryOnPipeline {
    catalog: Arc<dyn ModelCatalog>,
    transfer: ImageTransfer,
    orchestrator: Option<Orchestrator>,
    background: Option<Arc<dyn BackgroundRemover>>,
    recorder: OutcomeRecorder,
    weights: Arc<ScoringWeights>,
}

impl TryOnPipeline {
    pub fn new(
        catalog: Arc<dyn ModelCatalog>,
        store: Arc<dyn ObjectStore>,
        weights: ScoringWeights,
    ) -> Self {
        Self {
            recorder: OutcomeRecorder::new(catalog.clone()),
            catalog,
            transfer: ImageTransfer::new(store),
            orchestrator: None,
            background: None,
            weights: Arc::new(weights),
        }
    }

    /// Without an orchestrator every request short-circuits to the
    /// pre-try-on image.
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_background_remover(mut self, remover: Arc<dyn BackgroundRemover>) -> Self {
        self.background = Some(remover);
        self
    }

    pub fn catalog(&self) -> &Arc<dyn ModelCatalog> {
        &self.catalog
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub async fn run(
        &self,
        request: TryOnRequest,
        cancel: &CancellationToken,
    ) -> Result<TryOnResponse, PipelineError> {
        if request.garment_image.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "validate",
                "garment_image is required",
            ));
        }
        let gender = Gender::from_loose(&request.gender);
        let mut stages = Vec::new();

        let (garment_url, fallback) = self
            .capture_stage("prepare_fallback", &mut stages, self.prepare_fallback(&request))
            .await?;

        let Some(orchestrator) = &self.orchestrator else {
            let outcome = TryOnOutcome::skipped(fallback, "no try-on provider is configured");
            return Ok(respond(outcome, None, None, stages));
        };

        let selected = self
            .capture_stage(
                "select_model",
                &mut stages,
                self.select(gender, &request.garment_category, request.model_id.as_deref()),
            )
            .await?;
        let Some(model) = selected else {
            let outcome = TryOnOutcome::skipped(fallback, "no active fashion models are available");
            return Ok(respond(outcome, None, None, stages));
        };

        let model_url = self
            .capture_stage("transfer_images", &mut stages, self.transfer_model_image(&model))
            .await?;
        let Some(model_url) = model_url else {
            let outcome = TryOnOutcome::Degraded {
                fallback,
                reason: "Virtual try-on failed: model image could not be made fetchable".into(),
            };
            return Ok(respond(outcome, Some(model.id), None, stages));
        };

        let category = provider_category(&request.garment_category);
        let started = Instant::now();
        let run = self
            .capture_stage("try_on", &mut stages, async {
                let run = orchestrator
                    .run(&fallback.url, &model_url, category, cancel)
                    .await;
                let output = serde_json::to_value(&run).unwrap_or(Value::Null);
                Ok(StageOutcome::new(run, output))
            })
            .await?;
        let elapsed = started.elapsed();

        let outcome = self
            .recorder
            .settle(&run, &model.id, fallback, elapsed)
            .await;
        info!(
            target = "thrift.tryon",
            model_id = %model.id,
            garment = %garment_url,
            tier = outcome.tier().as_str(),
            "tryon_request_finished"
        );
        let job_id = run.job_id().map(str::to_string);
        Ok(respond(outcome, Some(model.id), job_id, stages))
    }

    async fn prepare_fallback(
        &self,
        request: &TryOnRequest,
    ) -> Result<StageOutcome<(String, FallbackImage)>, PipelineError> {
        let garment_url = self
            .transfer
            .ensure_fetchable(&request.garment_image, ImagePurpose::Garment)
            .await
            .map_err(|err| transfer_error("prepare_fallback", err))?;

        let (fallback, source) = match request
            .background_removed_image
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
        {
            Some(raw) => {
                let url = self
                    .transfer
                    .ensure_fetchable(raw, ImagePurpose::Background)
                    .await
                    .map_err(|err| transfer_error("prepare_fallback", err))?;
                (
                    FallbackImage {
                        url,
                        background_removed: true,
                    },
                    "caller",
                )
            }
            None => match self.remove_background(&garment_url).await {
                Some(url) => (
                    FallbackImage {
                        url,
                        background_removed: true,
                    },
                    "provider",
                ),
                None => (
                    FallbackImage {
                        url: garment_url.clone(),
                        background_removed: false,
                    },
                    "original",
                ),
            },
        };

        let output = json!({
            "garment_url": garment_url,
            "fallback_url": fallback.url,
            "background_removed": fallback.background_removed,
            "source": source,
        });
        Ok(StageOutcome::new((garment_url, fallback), output))
    }

    async fn remove_background(&self, garment_url: &str) -> Option<String> {
        let remover = self.background.as_ref()?;
        let bytes = match remover.remove(garment_url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target = "thrift.tryon", error = %err, "background_removal_fallback");
                return None;
            }
        };
        let Some(format) = ImageFormat::sniff(&bytes) else {
            warn!(target = "thrift.tryon", "background_removal_returned_non_image");
            return None;
        };
        match self
            .transfer
            .upload(ImagePurpose::Background, format, bytes)
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(target = "thrift.tryon", error = %err, "background_upload_failed");
                None
            }
        }
    }

    async fn select(
        &self,
        gender: Gender,
        garment_category: &str,
        pinned: Option<&str>,
    ) -> Result<StageOutcome<Option<FashionModel>>, PipelineError> {
        let mapped = selector::map_garment_to_category(garment_category);

        if let Some(id) = pinned.map(str::trim).filter(|id| !id.is_empty()) {
            let model = match self.catalog.get(id).await {
                Ok(model) if model.is_active => model,
                Ok(_) => {
                    return Err(PipelineError::not_found(
                        "select_model",
                        format!("fashion model `{id}` is inactive"),
                    ));
                }
                Err(CatalogError::NotFound(_)) => {
                    return Err(PipelineError::not_found(
                        "select_model",
                        format!("fashion model `{id}` not found"),
                    ));
                }
                Err(err) => {
                    warn!(target = "thrift.catalog", error = %err, "pinned_model_lookup_failed");
                    return Ok(StageOutcome::new(
                        None,
                        json!({"pinned": id, "error": err.to_string()}),
                    ));
                }
            };
            let output = json!({
                "pinned": true,
                "model_id": model.id,
                "mapped_category": mapped,
                "gender": gender,
            });
            return Ok(StageOutcome::new(Some(model), output));
        }

        let candidates = match self.catalog.list_active().await {
            Ok(models) => models,
            Err(err) => {
                warn!(target = "thrift.catalog", error = %err, "catalog_unavailable");
                Vec::new()
            }
        };
        let ranked = rank(&candidates, gender, garment_category, &self.weights);
        let output = json!({
            "pinned": false,
            "candidates": candidates.len(),
            "mapped_category": mapped,
            "gender": gender,
            "model_id": ranked.as_ref().map(|r| r.model.id.clone()),
            "score": ranked.as_ref().map(|r| r.score),
            "exact_match": ranked.as_ref().map(|r| r.exact_match),
        });
        Ok(StageOutcome::new(ranked.map(|r| r.model), output))
    }

    async fn transfer_model_image(
        &self,
        model: &FashionModel,
    ) -> Result<StageOutcome<Option<String>>, PipelineError> {
        match self
            .transfer
            .ensure_fetchable(&model.image_url, ImagePurpose::Model)
            .await
        {
            Ok(url) => Ok(StageOutcome::new(
                Some(url.clone()),
                json!({"model_id": model.id, "model_image": url}),
            )),
            Err(err) => {
                warn!(
                    target = "thrift.transfer",
                    model_id = %model.id,
                    error = %err,
                    "model_image_unusable"
                );
                Ok(StageOutcome::new(
                    None,
                    json!({"model_id": model.id, "error": err.to_string()}),
                ))
            }
        }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

/// Jitter comes from the thread-local RNG; kept out of async code so the
/// pipeline future stays `Send`.
fn rank(
    candidates: &[FashionModel],
    gender: Gender,
    garment_category: &str,
    weights: &ScoringWeights,
) -> Option<RankedModel> {
    let mut rng = rand::rng();
    selector::select_model(candidates, gender, garment_category, None, weights, &mut rng)
}

fn respond(
    outcome: TryOnOutcome,
    model_id: Option<String>,
    job_id: Option<String>,
    stages: Vec<StageReport>,
) -> TryOnResponse {
    TryOnResponse {
        success: true,
        processed_image_url: outcome.image_url().to_string(),
        message: outcome.message(),
        tier: outcome.tier(),
        model_id,
        job_id,
        stages,
    }
}

fn transfer_error(stage: &'static str, err: TransferError) -> PipelineError {
    match err {
        TransferError::InvalidEncoding(_) | TransferError::UnsupportedReference(_) => {
            PipelineError::invalid_input(stage, err.to_string())
        }
        TransferError::Upload(_) => PipelineError::internal(stage, err.to_string()),
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::NotFound,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgremove::BackgroundRemovalError;
    use crate::catalog::{InMemoryCatalog, ModelCategory};
    use crate::outcome::OutcomeTier;
    use crate::storage::MemoryStore;
    use crate::tryon::testing::{ScriptedProvider, Step, completed, failed};
    use async_trait::async_trait;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use std::time::Duration;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    struct FixedRemover;

    #[async_trait]
    impl BackgroundRemover for FixedRemover {
        async fn remove(&self, _image_url: &str) -> Result<Vec<u8>, BackgroundRemovalError> {
            let mut bytes = PNG_MAGIC.to_vec();
            bytes.extend_from_slice(b"transparent");
            Ok(bytes)
        }
    }

    fn model(id: &str, gender: Gender, category: ModelCategory) -> FashionModel {
        FashionModel::new(id, id, gender, category, format!("https://cdn.example/{id}.jpg"))
    }

    struct Harness {
        pipeline: TryOnPipeline,
        catalog: Arc<InMemoryCatalog>,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
    }

    fn harness(models: Vec<FashionModel>, steps: Vec<Step>) -> Harness {
        let catalog = Arc::new(InMemoryCatalog::new(models));
        let store = Arc::new(MemoryStore::new("http://localhost:8000"));
        let provider = Arc::new(ScriptedProvider::new(steps));
        let pipeline = TryOnPipeline::new(catalog.clone(), store.clone(), ScoringWeights::default())
            .with_orchestrator(Orchestrator::new(
                provider.clone(),
                Duration::from_secs(4),
                15,
            ));
        Harness {
            pipeline,
            catalog,
            provider,
            store,
        }
    }

    fn request(category: &str, gender: &str) -> TryOnRequest {
        TryOnRequest {
            garment_image: "https://cdn.example/garment.jpg".into(),
            garment_category: category.into(),
            gender: gender.into(),
            model_id: None,
            background_removed_image: Some("https://cdn.example/garment-nobg.png".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_tryon_returns_provider_output_and_counts_success() {
        let h = harness(
            vec![model("m1", Gender::Women, ModelCategory::Evening)],
            vec![completed("https://cdn/x.jpg")],
        );
        let resp = h
            .pipeline
            .run(request("Evening Gown", "female"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.processed_image_url, "https://cdn/x.jpg");
        assert_eq!(resp.tier, OutcomeTier::TryOn);
        assert_eq!(resp.model_id.as_deref(), Some("m1"));
        assert_eq!(resp.job_id.as_deref(), Some("job-1"));

        let t = h.catalog.get("m1").await.unwrap().telemetry;
        assert_eq!(t.usage_count, 1);
        assert_eq!(t.tryon_successes, 1);

        let submissions = h.provider.submissions.lock().unwrap();
        assert_eq!(submissions[0].garment_image, "https://cdn.example/garment-nobg.png");
        assert_eq!(submissions[0].model_image, "https://cdn.example/m1.jpg");
        assert_eq!(submissions[0].category, "one-pieces");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tryon_degrades_to_pre_tryon_image() {
        let h = harness(
            vec![model("m1", Gender::Men, ModelCategory::Casual)],
            vec![failed("bad input")],
        );
        let resp = h
            .pipeline
            .run(request("jeans", "men"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.processed_image_url, "https://cdn.example/garment-nobg.png");
        assert_eq!(resp.tier, OutcomeTier::BackgroundRemoved);
        assert!(resp.message.contains("failed"), "{}", resp.message);

        let t = h.catalog.get("m1").await.unwrap().telemetry;
        assert_eq!(t.usage_count, 1);
        assert_eq!(t.tryon_successes, 0);
        assert_eq!(t.tryon_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalog_skips_tryon_without_writes() {
        let h = harness(vec![], vec![]);
        let mut req = request("t-shirt", "unisex");
        req.background_removed_image = None;
        let resp = h
            .pipeline
            .run(req, &CancellationToken::new())
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.processed_image_url, "https://cdn.example/garment.jpg");
        assert_eq!(resp.tier, OutcomeTier::Original);
        assert!(resp.message.contains("skipped"));
        assert!(resp.model_id.is_none());
        assert!(h.provider.submissions.lock().unwrap().is_empty());
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_model_bypasses_selector_and_is_recorded() {
        let h = harness(
            vec![
                model("best", Gender::Women, ModelCategory::Evening),
                model("m1", Gender::Men, ModelCategory::Athletic),
            ],
            vec![completed("https://cdn/pinned.jpg")],
        );
        let mut req = request("Evening Gown", "women");
        req.model_id = Some("m1".into());
        let resp = h
            .pipeline
            .run(req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.model_id.as_deref(), Some("m1"));
        assert_eq!(h.catalog.get("m1").await.unwrap().telemetry.usage_count, 1);
        assert_eq!(h.catalog.get("best").await.unwrap().telemetry.usage_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_or_inactive_pin_is_not_found() {
        let mut inactive = model("retired", Gender::Women, ModelCategory::General);
        inactive.is_active = false;
        let h = harness(vec![inactive], vec![]);

        for id in ["ghost", "retired"] {
            let mut req = request("dress", "women");
            req.model_id = Some(id.into());
            let err = h
                .pipeline
                .run(req, &CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), PipelineErrorKind::NotFound);
            assert_eq!(err.stage(), "select_model");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_absorbed_into_fallback() {
        let h = harness(vec![model("m1", Gender::Women, ModelCategory::Casual)], vec![]);
        let resp = h
            .pipeline
            .run(request("hoodie", "women"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.success);
        assert!(resp.message.contains("timed out"));
        assert_eq!(h.catalog.get("m1").await.unwrap().telemetry.tryon_attempts, 1);
    }

    #[tokio::test]
    async fn missing_provider_short_circuits_to_background_removal() {
        let catalog = Arc::new(InMemoryCatalog::new([model(
            "m1",
            Gender::Women,
            ModelCategory::Casual,
        )]));
        let store = Arc::new(MemoryStore::new("http://localhost:8000"));
        let pipeline = TryOnPipeline::new(catalog.clone(), store.clone(), ScoringWeights::default())
            .with_background_remover(Arc::new(FixedRemover));

        let mut req = request("tee", "women");
        req.background_removed_image = None;
        let resp = pipeline.run(req, &CancellationToken::new()).await.unwrap();

        assert_eq!(resp.tier, OutcomeTier::BackgroundRemoved);
        assert!(resp.message.contains("no try-on provider"));
        let stored = store.fetch_url(&resp.processed_image_url).await.unwrap();
        assert!(stored.bytes.starts_with(&PNG_MAGIC));
        assert_eq!(catalog.get("m1").await.unwrap().telemetry.usage_count, 0);
    }

    #[tokio::test]
    async fn malformed_inline_garment_is_rejected() {
        let h = harness(vec![model("m1", Gender::Women, ModelCategory::Casual)], vec![]);
        let mut req = request("tee", "women");
        req.garment_image = format!("data:image/png;base64,{}", BASE64.encode(b"not a png"));
        let err = h
            .pipeline
            .run(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "prepare_fallback");
    }

    #[tokio::test]
    async fn blank_garment_is_rejected() {
        let h = harness(vec![], vec![]);
        let mut req = request("tee", "women");
        req.garment_image = "  ".into();
        let err = h
            .pipeline
            .run(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test(start_paused = true)]
    async fn inline_garment_is_uploaded_before_submission() {
        let h = harness(
            vec![model("m1", Gender::Men, ModelCategory::Formal)],
            vec![completed("https://cdn/suit.jpg")],
        );
        let mut png = PNG_MAGIC.to_vec();
        png.extend_from_slice(b"garment");
        let mut req = request("Wool Suit", "male");
        req.garment_image = format!("data:image/png;base64,{}", BASE64.encode(&png));
        req.background_removed_image = None;

        let resp = h
            .pipeline
            .run(req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.processed_image_url, "https://cdn/suit.jpg");

        let submitted = h.provider.submissions.lock().unwrap()[0].garment_image.clone();
        assert!(submitted.starts_with("http://localhost:8000/objects/tryon/garments/"));
        assert_eq!(h.store.fetch_url(&submitted).await.unwrap().bytes, png);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_transcript_covers_the_full_flow() {
        let h = harness(
            vec![model("m1", Gender::Women, ModelCategory::Evening)],
            vec![completed("https://cdn/x.jpg")],
        );
        let resp = h
            .pipeline
            .run(request("gown", "women"), &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<String> = resp.stages.iter().map(|s| s.name.clone()).collect();
        assert_eq!(
            names,
            vec!["prepare_fallback", "select_model", "transfer_images", "try_on"]
        );
        assert_eq!(resp.stages[3].output["status"], "completed");
    }
}
