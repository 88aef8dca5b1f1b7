use crate::config::BackgroundRemovalConfig;
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackgroundRemovalError {
    #[error("http error: {0}")]
    Http(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("empty image returned")]
    Empty,
}

/// Produces a transparent-background PNG for a fetchable image URL.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove(&self, image_url: &str) -> Result<Vec<u8>, BackgroundRemovalError>;
}

pub struct RemoveBgClient {
    endpoint: String,
    api_key: String,
    http: Client,
}

impl RemoveBgClient {
    pub fn new(config: &BackgroundRemovalConfig, http: Client) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            http,
        }
    }
}

#[async_trait]
impl BackgroundRemover for RemoveBgClient {
    async fn remove(&self, image_url: &str) -> Result<Vec<u8>, BackgroundRemovalError> {
        let params = [("image_url", image_url), ("size", "auto"), ("format", "png")];
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Api-Key", &self.api_key)
            .form(&params)
            .send()
            .await
            .map_err(|err| BackgroundRemovalError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(BackgroundRemovalError::Status(response.status().as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| BackgroundRemovalError::Http(err.to_string()))?;
        if bytes.is_empty() {
            return Err(BackgroundRemovalError::Empty);
        }
        Ok(bytes.to_vec())
    }
}
