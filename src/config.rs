use crate::selector::ScoringWeights;
use eyre::{Result, WrapErr};
use std::{env, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub public_base_url: String,
    pub body_limit: usize,
    pub queue_capacity: usize,
    pub jobs: JobRetention,
    /// Upload cap for the in-memory object store.
    pub memory_store_objects: usize,
    pub http: HttpTimeouts,
    pub tryon: TryOnConfig,
    pub background_removal: Option<BackgroundRemovalConfig>,
    pub supabase: Option<SupabaseConfig>,
    pub weights: ScoringWeights,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            connect: Duration::from_secs(5),
        }
    }
}

/// How long finished background jobs stay queryable.
#[derive(Debug, Clone, Copy)]
pub struct JobRetention {
    pub ttl: Duration,
    pub max_finished: usize,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            max_finished: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TryOnConfig {
    /// Absent key disables virtual try-on entirely.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model_name: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for TryOnConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.fashn.ai/v1".into(),
            model_name: "tryon-v1.6".into(),
            poll_interval: Duration::from_millis(4000),
            max_polls: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundRemovalConfig {
    pub api_key: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub base_url: String,
    pub service_key: String,
    pub bucket: String,
    pub models_table: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env_parse("PORT", 8000)?;
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let http = HttpTimeouts {
            request: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 15)?),
            connect: Duration::from_secs(env_parse("HTTP_CONNECT_TIMEOUT_SECS", 5)?),
        };

        let defaults = TryOnConfig::default();
        let tryon = TryOnConfig {
            api_key: env_opt("FASHN_API_KEY"),
            base_url: env_opt("FASHN_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            model_name: env_opt("FASHN_MODEL_NAME").unwrap_or(defaults.model_name),
            poll_interval: Duration::from_millis(env_parse("TRYON_POLL_INTERVAL_MS", 4000)?),
            max_polls: env_parse::<u32>("TRYON_MAX_POLLS", defaults.max_polls)?.max(1),
        };

        let background_removal =
            env_opt("REMOVE_BG_API_KEY").map(|api_key| BackgroundRemovalConfig {
                api_key,
                endpoint: env_opt("REMOVE_BG_URL")
                    .unwrap_or_else(|| "https://api.remove.bg/v1.0/removebg".into()),
            });

        let job_defaults = JobRetention::default();
        let jobs = JobRetention {
            ttl: Duration::from_secs(env_parse("JOB_RETENTION_SECS", job_defaults.ttl.as_secs())?),
            max_finished: env_parse::<usize>("JOB_MAX_FINISHED", job_defaults.max_finished)?
                .max(1),
        };

        let supabase = match env_opt("SUPABASE_URL") {
            Some(base_url) => {
                let service_key = env_opt("SUPABASE_SERVICE_ROLE_KEY")
                    .or_else(|| env_opt("SUPABASE_SERVICE_KEY"))
                    .ok_or_else(|| {
                        eyre::eyre!("SUPABASE_URL is set but SUPABASE_SERVICE_ROLE_KEY is missing")
                    })?;
                Some(SupabaseConfig {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    service_key,
                    bucket: env_opt("SUPABASE_STORAGE_BUCKET").unwrap_or_else(|| "tryon".into()),
                    models_table: env_opt("SUPABASE_MODELS_TABLE")
                        .unwrap_or_else(|| "fashion_models".into()),
                })
            }
            None => None,
        };

        let weights = match env_opt("SCORING_WEIGHTS_PATH") {
            Some(path) => ScoringWeights::from_yaml_file(&path)
                .wrap_err_with(|| format!("loading scoring weights from {path}"))?,
            None => ScoringWeights::default(),
        };

        Ok(Self {
            port,
            public_base_url,
            body_limit: env_parse::<usize>("REQUEST_MAX_BYTES", 8 * 1024 * 1024)?.max(1024),
            queue_capacity: env_parse::<usize>("QUEUE_CAPACITY", 64)?.max(1),
            jobs,
            memory_store_objects: env_parse::<usize>(
                "MEMORY_STORE_MAX_OBJECTS",
                crate::storage::DEFAULT_MEMORY_STORE_OBJECTS,
            )?
            .max(1),
            http,
            tryon,
            background_removal,
            supabase,
            weights,
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse::<T>()
            .wrap_err_with(|| format!("invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}
