use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::entity::dataset_entry;
use crate::error::GatewayError;

/// Read-mostly catalogue of dataset entries. Loaded per request; the only
/// write path is the idempotent admin upsert.
pub struct CatalogueStore {
    db: DatabaseConnection,
}

/// Upsert payload for `POST /admin/catalogue`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetImport {
    pub dataset_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_backend_type")]
    pub backend_type: String,
    pub backend_config: Option<serde_json::Value>,
    #[serde(default = "default_expose")]
    pub expose: bool,
    pub access_level: Option<String>,
    pub lineage: Option<serde_json::Value>,
    pub publisher: Option<String>,
    pub license: Option<String>,
}

fn default_backend_type() -> String {
    "postgres".to_string()
}

fn default_expose() -> bool {
    true
}

impl CatalogueStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Load a single entry by dataset id.
    pub async fn load(&self, dataset_id: &str) -> Result<dataset_entry::Model, GatewayError> {
        self.find_by_id(dataset_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Dataset not found".to_string()))
    }

    /// Load a single exposed entry; hidden datasets are indistinguishable
    /// from absent ones on this path.
    pub async fn load_exposed(
        &self,
        dataset_id: &str,
    ) -> Result<dataset_entry::Model, GatewayError> {
        match self.find_by_id(dataset_id).await? {
            Some(entry) if entry.expose => Ok(entry),
            _ => Err(GatewayError::NotFound("Dataset not found".to_string())),
        }
    }

    /// Resolve every logical table name referenced by a query in one
    /// batched lookup. Unknown identifiers are reported together.
    pub async fn resolve_for_tables(
        &self,
        table_names: &BTreeSet<String>,
    ) -> Result<HashMap<String, dataset_entry::Model>, GatewayError> {
        if table_names.is_empty() {
            return Err(GatewayError::invalid("Query references no datasets"));
        }

        let entries = dataset_entry::Entity::find()
            .filter(dataset_entry::Column::DatasetId.is_in(table_names.iter().cloned()))
            .all(&self.db)
            .await
            .map_err(store_error)?;

        let by_id: HashMap<String, dataset_entry::Model> = entries
            .into_iter()
            .map(|e| (e.dataset_id.clone(), e))
            .collect();

        let missing: Vec<&str> = table_names
            .iter()
            .filter(|name| !by_id.contains_key(name.as_str()))
            .map(|s| s.as_str())
            .collect();

        if !missing.is_empty() {
            tracing::warn!(datasets = ?missing, "Query references unknown datasets");
            return Err(GatewayError::invalid(format!(
                "Query references unknown datasets: [{}]",
                missing.join(", ")
            )));
        }

        Ok(by_id)
    }

    /// All exposed entries, for the catalogue listing.
    pub async fn list_exposed(&self) -> Result<Vec<dataset_entry::Model>, GatewayError> {
        dataset_entry::Entity::find()
            .filter(dataset_entry::Column::Expose.eq(true))
            .all(&self.db)
            .await
            .map_err(store_error)
    }

    /// Idempotent upsert keyed by dataset id. Returns (created, updated).
    pub async fn upsert_many(
        &self,
        items: Vec<DatasetImport>,
    ) -> Result<(u64, u64), GatewayError> {
        let mut created = 0u64;
        let mut updated = 0u64;
        let now = Utc::now().naive_utc();

        for item in items {
            match self.find_by_id(&item.dataset_id).await? {
                Some(existing) => {
                    let mut active: dataset_entry::ActiveModel = existing.into();
                    active.title = Set(item.title);
                    active.description = Set(item.description);
                    active.backend_type = Set(item.backend_type);
                    active.backend_config = Set(item.backend_config);
                    active.expose = Set(item.expose);
                    active.access_level = Set(item.access_level);
                    active.lineage = Set(item.lineage);
                    active.publisher = Set(item.publisher);
                    active.license = Set(item.license);
                    active.updated_at = Set(now);
                    active.update(&self.db).await.map_err(store_error)?;
                    updated += 1;
                }
                None => {
                    dataset_entry::ActiveModel {
                        id: Set(Uuid::now_v7()),
                        dataset_id: Set(item.dataset_id),
                        title: Set(item.title),
                        description: Set(item.description),
                        backend_type: Set(item.backend_type),
                        backend_config: Set(item.backend_config),
                        expose: Set(item.expose),
                        access_level: Set(item.access_level),
                        lineage: Set(item.lineage),
                        publisher: Set(item.publisher),
                        license: Set(item.license),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(&self.db)
                    .await
                    .map_err(store_error)?;
                    created += 1;
                }
            }
        }

        Ok((created, updated))
    }

    async fn find_by_id(
        &self,
        dataset_id: &str,
    ) -> Result<Option<dataset_entry::Model>, GatewayError> {
        dataset_entry::Entity::find()
            .filter(dataset_entry::Column::DatasetId.eq(dataset_id))
            .one(&self.db)
            .await
            .map_err(store_error)
    }
}

fn store_error(e: sea_orm::DbErr) -> GatewayError {
    tracing::error!(error = %e, "Catalogue store error");
    GatewayError::Config("Catalogue store error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn setup() -> CatalogueStore {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        CatalogueStore::new(db)
    }

    fn import(dataset_id: &str, expose: bool, access_level: &str) -> DatasetImport {
        DatasetImport {
            dataset_id: dataset_id.to_string(),
            title: Some(format!("{dataset_id} title")),
            description: None,
            backend_type: "postgres".to_string(),
            backend_config: Some(json!({"table": format!("public.{dataset_id}")})),
            expose,
            access_level: Some(access_level.to_string()),
            lineage: None,
            publisher: None,
            license: None,
        }
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // --- upsert ---

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = setup().await;
        let (created, updated) = store
            .upsert_many(vec![import("ds_a", true, "open")])
            .await
            .unwrap();
        assert_eq!((created, updated), (1, 0));

        let mut second = import("ds_a", true, "internal");
        second.title = Some("renamed".to_string());
        let (created, updated) = store.upsert_many(vec![second]).await.unwrap();
        assert_eq!((created, updated), (0, 1));

        let entry = store.load("ds_a").await.unwrap();
        assert_eq!(entry.title.as_deref(), Some("renamed"));
        assert_eq!(entry.access_level.as_deref(), Some("internal"));
    }

    #[tokio::test]
    async fn upsert_preserves_dataset_id_uniqueness() {
        let store = setup().await;
        store
            .upsert_many(vec![import("ds_a", true, "open"), import("ds_a", true, "open")])
            .await
            .unwrap();
        let all = store.list_exposed().await.unwrap();
        assert_eq!(all.len(), 1, "second upsert must update, not duplicate");
    }

    // --- load ---

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = setup().await;
        let err = store.load("missing").await.unwrap_err();
        assert_eq!(err, GatewayError::NotFound("Dataset not found".to_string()));
    }

    #[tokio::test]
    async fn load_exposed_hides_hidden_entries() {
        let store = setup().await;
        store
            .upsert_many(vec![import("ds_hidden", false, "open")])
            .await
            .unwrap();

        assert!(store.load("ds_hidden").await.is_ok());
        let err = store.load_exposed("ds_hidden").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    // --- resolve_for_tables ---

    #[tokio::test]
    async fn resolve_batches_all_references() {
        let store = setup().await;
        store
            .upsert_many(vec![import("ds_a", true, "open"), import("ds_b", true, "open")])
            .await
            .unwrap();

        let resolved = store
            .resolve_for_tables(&names(&["ds_a", "ds_b"]))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved["ds_a"].physical_table().as_deref(),
            Some("public.ds_a")
        );
    }

    #[tokio::test]
    async fn resolve_empty_set_is_rejected() {
        let store = setup().await;
        let err = store.resolve_for_tables(&BTreeSet::new()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::invalid("Query references no datasets")
        );
    }

    #[tokio::test]
    async fn resolve_reports_every_unknown_dataset() {
        let store = setup().await;
        store
            .upsert_many(vec![import("ds_a", true, "open")])
            .await
            .unwrap();

        let err = store
            .resolve_for_tables(&names(&["ds_a", "nope_1", "nope_2"]))
            .await
            .unwrap_err();
        let msg = err.message();
        assert!(msg.contains("nope_1"), "missing id not reported: {msg}");
        assert!(msg.contains("nope_2"), "missing id not reported: {msg}");
        assert!(!msg.contains("ds_a"), "known id wrongly reported: {msg}");
    }

    #[tokio::test]
    async fn resolve_includes_hidden_entries() {
        // Hidden datasets are still governed; the executor decides what to
        // do with them, not the resolver.
        let store = setup().await;
        store
            .upsert_many(vec![import("ds_hidden", false, "open")])
            .await
            .unwrap();
        let resolved = store
            .resolve_for_tables(&names(&["ds_hidden"]))
            .await
            .unwrap();
        assert!(!resolved["ds_hidden"].expose);
    }

    #[tokio::test]
    async fn dotted_dataset_ids_resolve_verbatim() {
        let store = setup().await;
        store
            .upsert_many(vec![import("prod.energy.solar", true, "open")])
            .await
            .unwrap();
        let resolved = store
            .resolve_for_tables(&names(&["prod.energy.solar"]))
            .await
            .unwrap();
        assert!(resolved.contains_key("prod.energy.solar"));
    }
}
