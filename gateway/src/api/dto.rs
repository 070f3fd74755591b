use serde::{Deserialize, Serialize};

use crate::catalogue::DatasetImport;
use crate::entity::dataset_entry;

// ---------- query ----------

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

// ---------- catalogue ----------

#[derive(Debug, Serialize)]
pub struct CatalogueEntryResponse {
    pub dataset_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub backend_type: String,
    pub access_level: Option<String>,
    pub publisher: Option<String>,
    pub license: Option<String>,
}

impl From<dataset_entry::Model> for CatalogueEntryResponse {
    fn from(m: dataset_entry::Model) -> Self {
        Self {
            dataset_id: m.dataset_id,
            title: m.title,
            description: m.description,
            backend_type: m.backend_type,
            access_level: m.access_level,
            publisher: m.publisher,
            license: m.license,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CatalogueImportRequest {
    pub datasets: Vec<DatasetImport>,
}

#[derive(Debug, Serialize)]
pub struct CatalogueImportResponse {
    pub created: u64,
    pub updated: u64,
}
