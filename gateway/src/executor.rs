use std::collections::HashMap;

use deadpool_postgres::Object;
use serde_json::{Map, Value};
use tokio_postgres::error::SqlState;

use crate::access::enforce_dataset_access;
use crate::api::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::GatewayError;
use crate::geometry;
use crate::row_filters::RowFilterPlan;
use crate::rows::{Cell, hex_encode, row_to_pairs};
use crate::sql::{parse_sql_query_with_depth, rewrite};

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 10_000;

/// Result of an executed dataset query.
#[derive(Debug, serde::Serialize)]
pub struct QueryOutcome {
    pub items: Vec<Map<String, Value>>,
    pub offset: i64,
    pub limit: i64,
    pub count: usize,
    pub total: i64,
}

/// Non-positive limits fall back to the default; everything is capped.
pub fn clamp_limit(limit: i64, default_limit: i64, max_limit: i64) -> i64 {
    if limit <= 0 {
        return default_limit;
    }
    limit.min(max_limit)
}

pub fn clamp_offset(offset: i64) -> i64 {
    offset.max(0)
}

/// Wrap a rewritten statement as an uncorrelated subquery for the data page.
fn paginated_sql(complete_sql: &str) -> String {
    format!("SELECT *\nFROM (\n{complete_sql}\n) AS q\nLIMIT $1 OFFSET $2")
}

/// Wrap a rewritten statement as an uncorrelated subquery for the total.
fn count_sql(complete_sql: &str) -> String {
    format!("SELECT COUNT(*) FROM (\n{complete_sql}\n) AS q")
}

/// Execute a governed dataset query end to end: validate, resolve, gate,
/// plan row filters, rewrite, paginate, run under a statement timeout and
/// post-process geometry values.
pub async fn execute_query(
    state: &AppState,
    raw_sql: Option<&str>,
    limit: i64,
    offset: i64,
    user: Option<&AuthenticatedUser>,
) -> Result<QueryOutcome, GatewayError> {
    let raw_sql = match raw_sql {
        Some(sql) if !sql.trim().is_empty() => sql,
        _ => return Err(GatewayError::invalid("sql query not provided")),
    };

    let parsed = parse_sql_query_with_depth(raw_sql, state.settings.max_ast_depth)?;
    tracing::debug!(
        tables = ?parsed.referenced_tables(),
        user = user.map(|u| u.sub.as_str()).unwrap_or("anonymous"),
        "Validated dataset query"
    );

    let datasets = state
        .catalogue
        .resolve_for_tables(parsed.referenced_tables())
        .await?;

    // Access checks run for every dataset before any row-filter handler
    // gets to make an outbound call.
    for entry in datasets.values() {
        if !entry.expose {
            return Err(GatewayError::Forbidden("Dataset not available".to_string()));
        }
        enforce_dataset_access(entry, user, &state.policy).await?;
    }

    let mut tables_map: HashMap<String, String> = HashMap::new();
    let mut plans: Vec<RowFilterPlan> = Vec::new();
    for (logical, entry) in &datasets {
        let physical = match entry.physical_table() {
            Some(table) => table,
            None if entry.backend_type == "postgres" => {
                tracing::warn!(dataset = %entry.dataset_id, "Missing backend_config.table");
                return Err(GatewayError::Config(
                    "Dataset backend table is not configured".to_string(),
                ));
            }
            None => {
                return Err(GatewayError::invalid(format!(
                    "Dataset is not queryable via SQL: {logical}"
                )));
            }
        };

        plans.extend(
            state
                .row_filters
                .plans_for_entry(entry, &physical, user)
                .await?,
        );
        tables_map.insert(logical.clone(), physical);
    }

    let mut statement = parsed.statement().clone();
    rewrite::substitute_tables(&mut statement, &tables_map);
    rewrite::apply_row_filter_plans(&mut statement, &plans);
    let complete_sql = statement.to_string();
    tracing::debug!(sql = %complete_sql, "Rewritten SQL");

    let limit = clamp_limit(limit, state.settings.default_limit, state.settings.max_limit);
    let offset = clamp_offset(offset);

    let mut client = state.warehouse.get().await.map_err(|e| {
        tracing::error!(error = %e, "Warehouse pool checkout failed");
        GatewayError::Upstream("Database unavailable".to_string())
    })?;

    let timeout_ms = state.settings.statement_timeout_ms;

    // Count and data run back to back on the same session, each in its own
    // transaction so SET LOCAL cannot leak into the pooled connection.
    let total: i64 = {
        let row = run_with_timeout(&mut client, timeout_ms, &count_sql(&complete_sql), &[])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::invalid("Database query failed"))?;
        row.get(0)
    };

    let rows = run_with_timeout(
        &mut client,
        timeout_ms,
        &paginated_sql(&complete_sql),
        &[&limit, &offset],
    )
    .await?;

    let items = postprocess_rows(&client, rows).await?;

    tracing::debug!(
        items = items.len(),
        total,
        offset,
        limit,
        "Dataset query complete"
    );

    Ok(QueryOutcome {
        count: items.len(),
        offset,
        limit,
        total,
        items,
    })
}

async fn run_with_timeout(
    client: &mut Object,
    timeout_ms: u64,
    sql: &str,
    params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
) -> Result<Vec<tokio_postgres::Row>, GatewayError> {
    let tx = client.transaction().await.map_err(internal_db_error)?;
    tx.batch_execute(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
        .await
        .map_err(internal_db_error)?;
    let rows = tx.query(sql, params).await.map_err(map_db_error)?;
    tx.commit().await.map_err(internal_db_error)?;
    Ok(rows)
}

/// Database-side failures are client errors by design: the statement was
/// already validated, so a rejection here is about the query's semantics
/// (missing column, type mismatch) or the timeout.
fn map_db_error(e: tokio_postgres::Error) -> GatewayError {
    if let Some(db) = e.as_db_error() {
        let timed_out = db.code() == &SqlState::QUERY_CANCELED
            || db.message().to_lowercase().contains("statement timeout");
        if timed_out {
            return GatewayError::invalid("Query exceeded time limit");
        }
        tracing::debug!(code = %db.code().code(), message = %db.message(), "Database rejected query");
    } else {
        tracing::debug!(error = %e, "Database query failed");
    }
    GatewayError::invalid("Database query failed")
}

fn internal_db_error(e: tokio_postgres::Error) -> GatewayError {
    tracing::error!(error = %e, "Warehouse session error");
    GatewayError::Config("Database session error".to_string())
}

/// Decode rows to JSON objects and convert geometry cells to GeoJSON via
/// an `ST_AsGeoJSON` round-trip on the same session.
async fn postprocess_rows(
    client: &Object,
    rows: Vec<tokio_postgres::Row>,
) -> Result<Vec<Map<String, Value>>, GatewayError> {
    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        let pairs = row_to_pairs(row).map_err(|e| {
            tracing::error!(error = %e, "Row decoding failed");
            GatewayError::invalid("Database query failed")
        })?;
        let mut object = Map::with_capacity(pairs.len());
        for (name, cell) in pairs {
            let value = match cell {
                Cell::Null => Value::Null,
                Cell::Json(value) => value,
                Cell::Geometry(wkb) => match geometry::wkb_to_geojson(client, &wkb).await {
                    Ok(Some(geojson)) => geojson,
                    Ok(None) => Value::Null,
                    Err(e) => {
                        tracing::warn!(column = %name, error = %e, "GeoJSON conversion failed");
                        Value::String(hex_encode(&wkb))
                    }
                },
            };
            object.insert(name, value);
        }
        items.push(object);
    }
    Ok(items)
}
