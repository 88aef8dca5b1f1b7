use super::{CatalogError, FashionModel, ModelCatalog};
use crate::config::SupabaseConfig;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use urlencoding::encode;

/// Catalog stored in a Supabase table, accessed through PostgREST.
#[derive(Debug, Clone)]
pub struct SupabaseCatalog {
    base_url: String,
    service_key: String,
    table: String,
    http: Client,
}

impl SupabaseCatalog {
    pub fn new(config: &SupabaseConfig, http: Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            table: config.models_table.clone(),
            http,
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn fetch_rows(&self, query: &str) -> Result<Vec<FashionModel>, CatalogError> {
        let url = format!("{}/rest/v1/{}?{}", self.base_url, self.table, query);
        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))
    }

    async fn write_telemetry(&self, model: &FashionModel) -> Result<(), CatalogError> {
        let mut body = serde_json::to_value(&model.telemetry)
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        if let Value::Object(map) = &mut body {
            map.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
        }

        let url = format!(
            "{}/rest/v1/{}?id=eq.{}",
            self.base_url,
            self.table,
            encode(&model.id)
        );
        let response = self
            .authed(self.http.patch(url))
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        debug!(target = "thrift.catalog", model_id = %model.id, "telemetry_written");
        Ok(())
    }
}

#[async_trait]
impl ModelCatalog for SupabaseCatalog {
    async fn list_active(&self) -> Result<Vec<FashionModel>, CatalogError> {
        self.fetch_rows("is_active=eq.true&select=*&order=sort_order.asc,created_at.desc")
            .await
    }

    async fn get(&self, id: &str) -> Result<FashionModel, CatalogError> {
        let mut rows = self
            .fetch_rows(&format!("id=eq.{}&select=*&limit=1", encode(id)))
            .await?;
        rows.pop()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    async fn record_usage(&self, id: &str) -> Result<(), CatalogError> {
        let mut model = self.get(id).await?;
        model.telemetry.apply_usage(Utc::now());
        self.write_telemetry(&model).await
    }

    async fn record_outcome(
        &self,
        id: &str,
        succeeded: bool,
        processing_ms: u64,
    ) -> Result<(), CatalogError> {
        let mut model = self.get(id).await?;
        model
            .telemetry
            .apply_outcome(succeeded, processing_ms, Utc::now());
        self.write_telemetry(&model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog(server: &MockServer) -> SupabaseCatalog {
        let config = SupabaseConfig {
            base_url: server.uri(),
            service_key: "service-key".into(),
            bucket: "tryon".into(),
            models_table: "fashion_models".into(),
        };
        SupabaseCatalog::new(&config, Client::new())
    }

    fn row(id: &str) -> Value {
        json!({
            "id": id,
            "name": "Kofi",
            "gender": "men",
            "category": "formal",
            "image_url": format!("https://cdn.example/{id}.jpg"),
            "is_active": true,
            "sort_order": 1,
            "usage_count": 4,
            "tryon_attempts": 3,
            "tryon_successes": 3,
            "success_rate": 100,
        })
    }

    #[tokio::test]
    async fn list_active_filters_and_orders_server_side() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/fashion_models"))
            .and(query_param("is_active", "eq.true"))
            .and(query_param("order", "sort_order.asc,created_at.desc"))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([row("m1")])))
            .expect(1)
            .mount(&server)
            .await;

        let models = catalog(&server).list_active().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].telemetry.usage_count, 4);
    }

    #[tokio::test]
    async fn get_maps_empty_result_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/fashion_models"))
            .and(query_param("id", "eq.ghost"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = catalog(&server).get("ghost").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn record_outcome_patches_recomputed_telemetry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/fashion_models"))
            .and(query_param("id", "eq.m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([row("m1")])))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/fashion_models"))
            .and(query_param("id", "eq.m1"))
            .and(body_partial_json(json!({
                "usage_count": 5,
                "tryon_attempts": 4,
                "tryon_successes": 3,
                "success_rate": 75.0,
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        catalog(&server)
            .record_outcome("m1", false, 2500)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_errors_surface_as_request_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = catalog(&server).list_active().await.unwrap_err();
        assert!(matches!(err, CatalogError::Request(msg) if msg.contains("503")));
    }
}
