mod bgremove;
mod catalog;
mod config;
mod http;
mod jobs;
mod metrics;
mod models;
mod outcome;
mod pipeline;
mod selector;
mod storage;
mod transfer;
mod tryon;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::{
    CatalogError, FashionModel, Gender, InMemoryCatalog, ModelCatalog, SupabaseCatalog,
};
use config::AppConfig;
use jobs::JobQueue;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, RecordOutcomeRequest, SelectModelRequest, SelectModelResponse, TryOnRequest,
    TryOnResponse,
};
use pipeline::{PipelineError, PipelineErrorKind, TryOnPipeline};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use storage::{MemoryStore, ObjectStore, SupabaseStorage};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use tryon::{FashnClient, Orchestrator};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "thrift.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let config = AppConfig::from_env()?;
    let client = http::build_client(&config.http);

    let catalog: Arc<dyn ModelCatalog>;
    let store: Arc<dyn ObjectStore>;
    let mut objects = None;
    match &config.supabase {
        Some(supabase) => {
            info!(target = "thrift.api", table = %supabase.models_table, "using supabase catalog");
            catalog = Arc::new(SupabaseCatalog::new(supabase, client.clone()));
            store = Arc::new(SupabaseStorage::new(supabase, client.clone()));
        }
        None => {
            warn!(target = "thrift.api", "SUPABASE_URL not set; using in-memory demo catalog");
            let memory = Arc::new(MemoryStore::with_capacity(
                config.public_base_url.clone(),
                config.memory_store_objects,
            ));
            catalog = Arc::new(InMemoryCatalog::demo());
            store = memory.clone();
            objects = Some(memory);
        }
    }

    let mut pipeline = TryOnPipeline::new(catalog, store, config.weights.clone());
    match FashnClient::from_config(&config.tryon, client.clone()) {
        Some(provider) => {
            pipeline = pipeline.with_orchestrator(Orchestrator::new(
                Arc::new(provider),
                config.tryon.poll_interval,
                config.tryon.max_polls,
            ));
        }
        None => warn!(target = "thrift.api", "FASHN_API_KEY not set; virtual try-on disabled"),
    }
    if let Some(remover) = &config.background_removal {
        pipeline = pipeline
            .with_background_remover(Arc::new(bgremove::RemoveBgClient::new(remover, client)));
    }

    let shutdown = CancellationToken::new();
    let (queue, worker) = JobQueue::spawn(
        pipeline.clone(),
        config.queue_capacity,
        config.jobs,
        shutdown.clone(),
    );
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        pipeline,
        queue,
        objects,
        prometheus_handle,
    };
    let app = build_router(state)
        .layer(axum::extract::DefaultBodyLimit::max(config.body_limit));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "thrift.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target = "thrift.api", "shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = worker.await;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: TryOnPipeline,
    queue: JobQueue,
    /// Present only when uploads are held in process memory.
    objects: Option<Arc<MemoryStore>>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/models", get(list_models))
        .route("/models/select", post(preview_selection))
        .route("/models/{id}/usage", post(record_usage))
        .route("/models/{id}/outcome", post(record_outcome))
        .route("/tryon", post(run_tryon))
        .nest(
            "/jobs",
            Router::new()
                .route("/tryon", post(enqueue_tryon_job))
                .route("/{id}", get(get_job_status).delete(cancel_job)),
        )
        .route("/objects/{*key}", get(serve_object))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "thrift-tryon-api",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<FashionModel>>, AppError> {
    crate::metrics::inc_requests("/models");
    let models = state.pipeline.catalog().list_active().await?;
    Ok(Json(models))
}

/// Preview which model a try-on request would use, with its score breakdown.
/// Writes nothing to the catalog.
///
/// - Method: `POST`
/// - Path: `/models/select`
/// - Body: `SelectModelRequest`
async fn preview_selection(
    State(state): State<AppState>,
    Json(payload): Json<SelectModelRequest>,
) -> Result<Json<SelectModelResponse>, AppError> {
    crate::metrics::inc_requests("/models/select");
    let gender = Gender::from_loose(&payload.gender);
    let mapped = selector::map_garment_to_category(&payload.garment_category);
    let candidates = state.pipeline.catalog().list_active().await?;
    let pinned = payload
        .model_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let ranked = {
        let mut rng = rand::rng();
        selector::select_model(
            &candidates,
            gender,
            &payload.garment_category,
            pinned,
            state.pipeline.weights(),
            &mut rng,
        )
    };
    if let (Some(id), None) = (pinned, &ranked) {
        return Err(CatalogError::NotFound(id.to_string()).into());
    }

    info!(
        target = "thrift.selector",
        candidates = candidates.len(),
        model_id = ranked.as_ref().map(|r| r.model.id.as_str()).unwrap_or("-"),
        "selection_previewed"
    );
    Ok(Json(SelectModelResponse {
        mapped_category: mapped.as_str().to_string(),
        gender: gender.as_str().to_string(),
        score: ranked.as_ref().map(|r| r.score),
        breakdown: ranked.as_ref().map(|r| r.breakdown),
        model: ranked.map(|r| r.model),
    }))
}

async fn record_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FashionModel>, AppError> {
    crate::metrics::inc_requests("/models/{id}/usage");
    let catalog = state.pipeline.catalog();
    catalog.record_usage(&id).await?;
    Ok(Json(catalog.get(&id).await?))
}

async fn record_outcome(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RecordOutcomeRequest>,
) -> Result<Json<FashionModel>, AppError> {
    crate::metrics::inc_requests("/models/{id}/outcome");
    let catalog = state.pipeline.catalog();
    catalog
        .record_outcome(&id, payload.succeeded, payload.processing_time_ms)
        .await?;
    Ok(Json(catalog.get(&id).await?))
}

/// Run the garment → try-on pipeline and wait for the result.
///
/// - Method: `POST`
/// - Path: `/tryon`
/// - Body: `TryOnRequest`
/// - Response: `TryOnResponse`. Provider failures still answer 200 with the
///   fallback image; only bad input and missing pinned models are errors.
async fn run_tryon(
    State(state): State<AppState>,
    Json(payload): Json<TryOnRequest>,
) -> Result<Json<TryOnResponse>, AppError> {
    crate::metrics::inc_requests("/tryon");
    // Client disconnects drop this future; nothing needs explicit cancelling.
    let response = state
        .pipeline
        .run(payload, &CancellationToken::new())
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_tryon_job(
    State(state): State<AppState>,
    Json(payload): Json<TryOnRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/tryon");
    let id = state
        .queue
        .enqueue(payload)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let uuid = parse_job_id(&id)?;
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("jobs", "job not found").into())
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    let uuid = parse_job_id(&id)?;
    state
        .queue
        .cancel(uuid)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("jobs", "job not found").into())
}

fn parse_job_id(raw: &str) -> Result<uuid::Uuid, AppError> {
    uuid::Uuid::parse_str(raw)
        .map_err(|_| PipelineError::invalid_input("jobs", "invalid_job_id").into())
}

async fn serve_object(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let found = match &state.objects {
        Some(store) => store.get(&key).await,
        None => None,
    };
    match found {
        Some(object) => (
            [(header::CONTENT_TYPE, object.content_type)],
            object.bytes,
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: "objects".into(),
                detail: Some(format!("no object stored under `{key}`")),
            }),
        )
            .into_response(),
    }
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Catalog(CatalogError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<CatalogError> for AppError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    ApiError {
                        error: err.stage().to_string(),
                        detail: Some(err.detail().to_string()),
                    },
                )
            }
            AppError::Catalog(err) => {
                let status = match err {
                    CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
                    CatalogError::Request(_) | CatalogError::Deserialize(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (
                    status,
                    ApiError {
                        error: "catalog".into(),
                        detail: Some(err.to_string()),
                    },
                )
            }
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
