use crate::config::SupabaseConfig;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Durable object storage that hands back publicly fetchable URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

impl SupabaseStorage {
    pub fn new(config: &SupabaseConfig, http: Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
            http,
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, key
        );
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|err| StorageError::Upload(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Upload(format!(
                "HTTP {}",
                response.status()
            )));
        }
        debug!(target = "thrift.transfer", key = key, "object_uploaded");
        Ok(self.public_url(key))
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Keeps objects in process memory and serves them from `{base}/objects/{key}`.
/// Holds at most `max_objects`; the oldest upload is evicted first.
pub struct MemoryStore {
    public_base_url: String,
    max_objects: usize,
    objects: RwLock<Objects>,
}

#[derive(Default)]
struct Objects {
    by_key: HashMap<String, StoredObject>,
    order: VecDeque<String>,
}

pub const DEFAULT_MEMORY_STORE_OBJECTS: usize = 512;

impl MemoryStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self::with_capacity(public_base_url, DEFAULT_MEMORY_STORE_OBJECTS)
    }

    pub fn with_capacity(public_base_url: impl Into<String>, max_objects: usize) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            max_objects: max_objects.max(1),
            objects: RwLock::new(Objects::default()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.by_key.get(key).cloned()
    }

    /// Resolves a URL previously returned by `put`.
    #[cfg(test)]
    pub async fn fetch_url(&self, url: &str) -> Option<StoredObject> {
        let prefix = format!("{}/objects/", self.public_base_url);
        let key = url.strip_prefix(&prefix)?;
        self.get(key).await
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.objects.read().await.by_key.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let mut objects = self.objects.write().await;
        let object = StoredObject {
            bytes,
            content_type: content_type.to_string(),
        };
        if objects.by_key.insert(key.to_string(), object).is_none() {
            objects.order.push_back(key.to_string());
        }
        while objects.by_key.len() > self.max_objects {
            let Some(oldest) = objects.order.pop_front() else {
                break;
            };
            objects.by_key.remove(&oldest);
            debug!(target = "thrift.transfer", key = %oldest, "memory_object_evicted");
        }
        Ok(format!("{}/objects/{}", self.public_base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn memory_store_serves_what_it_stored() {
        let store = MemoryStore::new("http://localhost:8000/");
        let url = store
            .put("tryon/garments/a.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8000/objects/tryon/garments/a.png");
        let object = store.fetch_url(&url).await.unwrap();
        assert_eq!(object.bytes, vec![1, 2, 3]);
        assert_eq!(object.content_type, "image/png");
        assert!(store.fetch_url("https://elsewhere/objects/x").await.is_none());
    }

    #[tokio::test]
    async fn memory_store_evicts_oldest_beyond_capacity() {
        let store = MemoryStore::with_capacity("http://localhost:8000", 2);
        for key in ["a.png", "b.png", "c.png"] {
            store.put(key, vec![1], "image/png").await.unwrap();
        }
        store.put("c.png", vec![2], "image/png").await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get("a.png").await.is_none());
        assert!(store.get("b.png").await.is_some());
        assert_eq!(store.get("c.png").await.unwrap().bytes, vec![2]);
    }

    #[tokio::test]
    async fn supabase_upload_returns_public_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/tryon/tryon/models/m.jpg"))
            .and(header("x-upsert", "true"))
            .and(header("Content-Type", "image/jpeg"))
            .and(body_bytes(vec![9u8, 8, 7]))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = SupabaseConfig {
            base_url: server.uri(),
            service_key: "k".into(),
            bucket: "tryon".into(),
            models_table: "fashion_models".into(),
        };
        let store = SupabaseStorage::new(&config, Client::new());
        let url = store
            .put("tryon/models/m.jpg", vec![9, 8, 7], "image/jpeg")
            .await
            .unwrap();
        assert_eq!(
            url,
            format!("{}/storage/v1/object/public/tryon/tryon/models/m.jpg", server.uri())
        );
    }

    #[tokio::test]
    async fn supabase_upload_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;
        let config = SupabaseConfig {
            base_url: server.uri(),
            service_key: "k".into(),
            bucket: "tryon".into(),
            models_table: "fashion_models".into(),
        };
        let err = SupabaseStorage::new(&config, Client::new())
            .put("k.png", vec![0], "image/png")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("413"));
    }
}
