use super::{
    CatalogError, FashionModel, Gender, ModelCatalog, ModelCategory, sort_for_selection,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local catalog used when no database is configured, and by tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    models: RwLock<HashMap<String, FashionModel>>,
}

impl InMemoryCatalog {
    pub fn new(models: impl IntoIterator<Item = FashionModel>) -> Self {
        let models = models
            .into_iter()
            .map(|model| (model.id.clone(), model))
            .collect();
        Self {
            models: RwLock::new(models),
        }
    }

    pub fn demo() -> Self {
        let now = Utc::now();
        let roster = [
            ("demo-amara", "Amara", Gender::Women, ModelCategory::Evening, 1, true),
            ("demo-lena", "Lena", Gender::Women, ModelCategory::Casual, 2, false),
            ("demo-kofi", "Kofi", Gender::Men, ModelCategory::Formal, 1, true),
            ("demo-diego", "Diego", Gender::Men, ModelCategory::Athletic, 3, false),
            ("demo-sam", "Sam", Gender::Unisex, ModelCategory::General, 5, false),
        ];
        Self::new(roster.into_iter().map(
            |(id, name, gender, category, sort_order, featured)| {
                let mut model = FashionModel::new(
                    id,
                    name,
                    gender,
                    category,
                    format!("https://images.thrift-demo.dev/models/{id}.jpg"),
                );
                model.pose = Some("front".into());
                model.sort_order = sort_order;
                model.is_featured = featured;
                model.created_at = Some(now);
                model
            },
        ))
    }
}

#[async_trait]
impl ModelCatalog for InMemoryCatalog {
    async fn list_active(&self) -> Result<Vec<FashionModel>, CatalogError> {
        let guard = self.models.read().await;
        let mut active: Vec<FashionModel> =
            guard.values().filter(|m| m.is_active).cloned().collect();
        sort_for_selection(&mut active);
        Ok(active)
    }

    async fn get(&self, id: &str) -> Result<FashionModel, CatalogError> {
        self.models
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    async fn record_usage(&self, id: &str) -> Result<(), CatalogError> {
        let mut guard = self.models.write().await;
        let model = guard
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let now = Utc::now();
        model.telemetry.apply_usage(now);
        model.updated_at = Some(now);
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: &str,
        succeeded: bool,
        processing_ms: u64,
    ) -> Result<(), CatalogError> {
        let mut guard = self.models.write().await;
        let model = guard
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let now = Utc::now();
        model.telemetry.apply_outcome(succeeded, processing_ms, now);
        model.updated_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str, sort_order: i32, active: bool) -> FashionModel {
        let mut m = FashionModel::new(
            id,
            id,
            Gender::Women,
            ModelCategory::Casual,
            format!("https://cdn.example/{id}.jpg"),
        );
        m.sort_order = sort_order;
        m.is_active = active;
        m
    }

    #[tokio::test]
    async fn list_active_skips_inactive_and_orders_by_sort_order() {
        let catalog = InMemoryCatalog::new([
            model("c", 3, true),
            model("a", 1, true),
            model("hidden", 0, false),
            model("b", 2, true),
        ]);
        let ids: Vec<String> = catalog
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn get_returns_inactive_records_and_reports_missing() {
        let catalog = InMemoryCatalog::new([model("hidden", 0, false)]);
        assert!(!catalog.get("hidden").await.unwrap().is_active);
        let err = catalog.get("nope").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn outcome_and_usage_mutate_only_the_target() {
        let catalog = InMemoryCatalog::new([model("a", 0, true), model("b", 0, true)]);
        catalog.record_outcome("a", true, 1200).await.unwrap();
        catalog.record_usage("a").await.unwrap();

        let a = catalog.get("a").await.unwrap();
        assert_eq!(a.telemetry.usage_count, 2);
        assert_eq!(a.telemetry.tryon_successes, 1);
        assert_eq!(a.telemetry.total_interactions, 2);
        assert_eq!(a.telemetry.success_rate, 100.0);

        let b = catalog.get("b").await.unwrap();
        assert_eq!(b.telemetry.usage_count, 0);
    }

    #[tokio::test]
    async fn demo_roster_is_selectable() {
        let catalog = InMemoryCatalog::demo();
        let active = catalog.list_active().await.unwrap();
        assert_eq!(active.len(), 5);
        assert!(active.iter().any(|m| m.gender == Gender::Unisex));
    }
}
