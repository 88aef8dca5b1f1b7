use super::{JobStatus, ProviderError, ProviderStatus, TryOnProvider, TryOnSubmission};
use crate::config::TryOnConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use urlencoding::encode;

pub struct FashnClient {
    base_url: String,
    api_key: String,
    model_name: String,
    http: Client,
}

impl FashnClient {
    /// `None` when no API key is configured.
    pub fn from_config(config: &TryOnConfig, http: Client) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model_name: config.model_name.clone(),
            http,
        })
    }
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    model_name: &'a str,
    inputs: RunInputs<'a>,
}

#[derive(Debug, Serialize)]
struct RunInputs<'a> {
    model_image: &'a str,
    garment_image: &'a str,
    category: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    output: Option<Vec<String>>,
    #[serde(default)]
    error: Option<Value>,
}

/// Provider errors arrive either as plain strings or as `{name, message}`.
fn describe_error(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl TryOnProvider for FashnClient {
    async fn submit(&self, submission: &TryOnSubmission) -> Result<String, ProviderError> {
        let body = RunRequest {
            model_name: &self.model_name,
            inputs: RunInputs {
                model_image: &submission.model_image,
                garment_image: &submission.garment_image,
                category: &submission.category,
            },
        };

        let response = self
            .http
            .post(format!("{}/run", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let payload: RunResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;

        match payload.id.filter(|id| !id.trim().is_empty()) {
            Some(id) => Ok(id),
            None => Err(ProviderError::Submission(
                payload
                    .error
                    .as_ref()
                    .and_then(describe_error)
                    .unwrap_or_else(|| "no job id returned".into()),
            )),
        }
    }

    async fn status(&self, job_id: &str) -> Result<ProviderStatus, ProviderError> {
        let response = self
            .http
            .get(format!("{}/status/{}", self.base_url, encode(job_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let payload: StatusResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;

        Ok(ProviderStatus {
            status: JobStatus::from_provider(&payload.status),
            output: payload.output.unwrap_or_default(),
            error: payload.error.as_ref().and_then(describe_error),
        })
    }
}
