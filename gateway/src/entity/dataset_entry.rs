use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dataset_entry")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Logical identifier as it appears in user SQL. Dotted segments are
    /// allowed (`prod.energy.solar`); the id is unique and immutable.
    #[sea_orm(unique)]
    pub dataset_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// `postgres` | `s3` | `fs`; only postgres backends are queryable.
    pub backend_type: String,
    /// Backend-specific JSON; for postgres: `{"table": "<schema.name>"}`.
    pub backend_config: Option<Json>,
    /// Hidden entries stay governed but disappear from the catalogue listing.
    pub expose: bool,
    /// `open` | `internal` | `restricted`; absent means open, anything else
    /// is a configuration error.
    pub access_level: Option<String>,
    /// OpenLineage-style document; governance facets live under
    /// `facets.governance`.
    pub lineage: Option<Json>,
    pub publisher: Option<String>,
    pub license: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Physical table behind this dataset, when it is queryable via SQL.
    pub fn physical_table(&self) -> Option<String> {
        if self.backend_type != "postgres" {
            return None;
        }
        self.backend_config
            .as_ref()?
            .get("table")?
            .as_str()
            .map(|s| s.to_string())
    }

    /// Governance facet (`lineage.facets.governance`) as a JSON object.
    pub fn governance(&self) -> Option<&serde_json::Map<String, Json>> {
        self.lineage
            .as_ref()?
            .get("facets")?
            .get("governance")?
            .as_object()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.lineage.as_ref()?.get("namespace")?.as_str()
    }
}
