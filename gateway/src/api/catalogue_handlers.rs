use axum::extract::{Path, State};
use axum::response::Json;

use crate::api::dto::{CatalogueEntryResponse, CatalogueImportRequest, CatalogueImportResponse};
use crate::api::{AppState, OptionalUser};
use crate::error::GatewayError;

// ---------- GET /health ----------

/// Ready iff a trivial query succeeds on the warehouse pool.
pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let not_ready = |e: String| {
        tracing::error!(error = %e, "Health check failed");
        GatewayError::Upstream("Service not ready".to_string())
    };

    let client = state
        .warehouse
        .get()
        .await
        .map_err(|e| not_ready(e.to_string()))?;
    client
        .query_one("SELECT 1", &[])
        .await
        .map_err(|e| not_ready(e.to_string()))?;

    Ok(Json(serde_json::json!({"status": "ready"})))
}

// ---------- GET /catalogue ----------

pub async fn list_catalogue(
    State(state): State<AppState>,
) -> Result<Json<Vec<CatalogueEntryResponse>>, GatewayError> {
    let entries = state.catalogue.list_exposed().await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

// ---------- GET /catalogue/{dataset_id}/schema ----------

/// JSON Schema describing the dataset's backing table, reflected from
/// `information_schema.columns`.
pub async fn dataset_schema(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let entry = state.catalogue.load_exposed(&dataset_id).await?;

    let Some(physical) = entry.physical_table() else {
        // Non-queryable backends expose an empty object schema.
        return Ok(Json(empty_schema()));
    };

    let (schema_name, table_name) = split_physical_table(&physical);

    let client = state.warehouse.get().await.map_err(|e| {
        tracing::error!(error = %e, "Warehouse pool checkout failed");
        GatewayError::Upstream("Database unavailable".to_string())
    })?;

    let rows = client
        .query(
            "SELECT column_name, data_type, udt_name, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&schema_name, &table_name],
        )
        .await
        .map_err(|e| {
            tracing::error!(dataset = %dataset_id, error = %e, "Table reflection failed");
            GatewayError::Config("Failed to describe table".to_string())
        })?;

    if rows.is_empty() {
        tracing::error!(dataset = %dataset_id, table = %physical, "Backing table has no columns");
        return Err(GatewayError::Config("Failed to describe table".to_string()));
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for row in rows {
        let column: String = row.get(0);
        let data_type: String = row.get(1);
        let udt_name: String = row.get(2);
        let is_nullable: String = row.get(3);
        let nullable = is_nullable.eq_ignore_ascii_case("yes");

        let (json_type, format) = pg_type_to_json(&data_type, &udt_name);
        let mut column_schema = serde_json::Map::new();
        column_schema.insert(
            "type".to_string(),
            serde_json::Value::String(json_type.to_string()),
        );
        column_schema.insert("nullable".to_string(), serde_json::Value::Bool(nullable));
        if let Some(format) = format {
            column_schema.insert(
                "format".to_string(),
                serde_json::Value::String(format.to_string()),
            );
        }
        if !nullable {
            required.push(serde_json::Value::String(column.clone()));
        }
        properties.insert(column, serde_json::Value::Object(column_schema));
    }

    Ok(Json(serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })))
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": {},
        "required": [],
    })
}

/// `catalog.schema.table` and `schema.table` keep their last two segments;
/// a bare table name lands in `public`.
fn split_physical_table(physical: &str) -> (String, String) {
    let parts: Vec<&str> = physical.split('.').collect();
    match parts.as_slice() {
        [.., schema, table] => (schema.to_string(), table.to_string()),
        [table] => ("public".to_string(), table.to_string()),
        [] => ("public".to_string(), String::new()),
    }
}

fn pg_type_to_json(data_type: &str, udt_name: &str) -> (&'static str, Option<&'static str>) {
    let name = data_type.to_lowercase();
    let udt = udt_name.to_lowercase();

    if udt == "geometry" || udt == "geography" {
        return ("object", Some("geojson"));
    }
    if name.contains("int") {
        return ("integer", None);
    }
    if name.contains("numeric") || name.contains("real") || name.contains("double") {
        return ("number", None);
    }
    if name.contains("bool") {
        return ("boolean", None);
    }
    if name.contains("timestamp") {
        return ("string", Some("date-time"));
    }
    if name.contains("date") {
        return ("string", Some("date"));
    }
    if name.contains("time") {
        return ("string", Some("time"));
    }
    if name.contains("json") {
        return ("object", None);
    }
    ("string", None)
}

// ---------- POST /admin/catalogue ----------

/// Idempotent catalogue upsert. Requires an authenticated caller whose
/// groups intersect the configured admin groups.
pub async fn import_catalogue(
    State(state): State<AppState>,
    OptionalUser(user): OptionalUser,
    Json(body): Json<CatalogueImportRequest>,
) -> Result<Json<CatalogueImportResponse>, GatewayError> {
    let user = user.ok_or_else(|| {
        GatewayError::Unauthenticated("Authentication required".to_string())
    })?;
    let is_admin = user
        .groups
        .iter()
        .any(|g| state.settings.admin_groups.iter().any(|admin| admin == g));
    if !is_admin {
        return Err(GatewayError::Forbidden(
            "Catalogue administration requires an admin group".to_string(),
        ));
    }

    let count = body.datasets.len();
    let (created, updated) = state.catalogue.upsert_many(body.datasets).await?;
    tracing::info!(user = %user.sub, entries = count, created, updated, "Catalogue import");
    Ok(Json(CatalogueImportResponse { created, updated }))
}
