use sqlparser::ast::Expr;

use crate::entity::dataset_entry;

pub mod handlers;
pub mod registry;

pub use registry::RowFilterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Predicate,
    Deny,
}

/// A resolved row-filter decision for one physical table.
///
/// `predicate` holds an AST fragment whose unqualified column references
/// the rewriter binds to each FROM occurrence's alias. A `Deny` plan zeroes
/// the result set regardless of the query's own WHERE clause.
#[derive(Debug, Clone)]
pub struct RowFilterPlan {
    pub table: String,
    pub kind: PlanKind,
    pub predicate: Option<Expr>,
    pub meta: serde_json::Value,
}

impl RowFilterPlan {
    pub fn predicate(table: impl Into<String>, predicate: Expr) -> Self {
        Self {
            table: table.into(),
            kind: PlanKind::Predicate,
            predicate: Some(predicate),
            meta: serde_json::Value::Null,
        }
    }

    pub fn deny(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: PlanKind::Deny,
            predicate: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// One `{handler, args}` entry from a dataset's governance facet.
#[derive(Debug, Clone)]
pub struct RowFilterSpec {
    pub handler: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Extract the ordered row-filter specs declared under
/// `lineage.facets.governance`. Both `rowFilters` and `row_filters` keys are
/// honoured; the legacy `userFilterColumn` shorthand is migrated to a
/// `direct_user_match` spec.
pub fn row_filter_specs(entry: &dataset_entry::Model) -> Vec<RowFilterSpec> {
    let Some(governance) = entry.governance() else {
        return Vec::new();
    };

    let mut specs = Vec::new();

    let declared = governance
        .get("rowFilters")
        .or_else(|| governance.get("row_filters"))
        .and_then(|v| v.as_array());
    if let Some(items) = declared {
        for item in items {
            let handler = item.get("handler").and_then(|h| h.as_str());
            match handler {
                Some(handler) if !handler.is_empty() => specs.push(RowFilterSpec {
                    handler: handler.to_string(),
                    args: item
                        .get("args")
                        .and_then(|a| a.as_object())
                        .cloned()
                        .unwrap_or_default(),
                }),
                _ => {
                    tracing::warn!(
                        dataset = %entry.dataset_id,
                        "Skipping row filter spec without a handler name"
                    );
                }
            }
        }
    }

    let legacy = governance
        .get("userFilterColumn")
        .or_else(|| governance.get("user_filter_column"))
        .and_then(|v| v.as_str());
    if let Some(column) = legacy {
        let mut args = serde_json::Map::new();
        args.insert(
            "column".to_string(),
            serde_json::Value::String(column.to_string()),
        );
        specs.push(RowFilterSpec {
            handler: "direct_user_match".to_string(),
            args,
        });
    }

    if !specs.is_empty() {
        tracing::debug!(
            dataset = %entry.dataset_id,
            count = specs.len(),
            "Dataset declares row filter specs"
        );
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn entry_with_governance(governance: serde_json::Value) -> dataset_entry::Model {
        let now = Utc::now().naive_utc();
        dataset_entry::Model {
            id: Uuid::now_v7(),
            dataset_id: "ds".to_string(),
            title: None,
            description: None,
            backend_type: "postgres".to_string(),
            backend_config: None,
            expose: true,
            access_level: None,
            lineage: Some(json!({"facets": {"governance": governance}})),
            publisher: None,
            license: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn reads_row_filters_in_declared_order() {
        let specs = row_filter_specs(&entry_with_governance(json!({
            "rowFilters": [
                {"handler": "direct_user_match", "args": {"column": "owner"}},
                {"handler": "table_pointer", "args": {"column": "sensor_id"}}
            ]
        })));
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].handler, "direct_user_match");
        assert_eq!(specs[0].args["column"], "owner");
        assert_eq!(specs[1].handler, "table_pointer");
    }

    #[test]
    fn snake_case_key_is_accepted() {
        let specs = row_filter_specs(&entry_with_governance(json!({
            "row_filters": [{"handler": "direct_user_match", "args": {"column": "owner"}}]
        })));
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn legacy_user_filter_column_becomes_direct_match() {
        let specs = row_filter_specs(&entry_with_governance(json!({
            "userFilterColumn": "owner_sub"
        })));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].handler, "direct_user_match");
        assert_eq!(specs[0].args["column"], "owner_sub");
    }

    #[test]
    fn malformed_specs_are_skipped() {
        let specs = row_filter_specs(&entry_with_governance(json!({
            "rowFilters": [
                {"args": {"column": "no_handler"}},
                "not-an-object",
                {"handler": "direct_user_match", "args": {"column": "ok"}}
            ]
        })));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].args["column"], "ok");
    }

    #[test]
    fn no_governance_means_no_specs() {
        let now = Utc::now().naive_utc();
        let entry = dataset_entry::Model {
            id: Uuid::now_v7(),
            dataset_id: "ds".to_string(),
            title: None,
            description: None,
            backend_type: "postgres".to_string(),
            backend_config: None,
            expose: true,
            access_level: None,
            lineage: None,
            publisher: None,
            license: None,
            created_at: now,
            updated_at: now,
        };
        assert!(row_filter_specs(&entry).is_empty());
    }
}
