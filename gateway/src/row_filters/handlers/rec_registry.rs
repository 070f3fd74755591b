use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlparser::ast::{Expr, Ident, Value};

use crate::auth::AuthenticatedUser;
use crate::row_filters::RowFilterPlan;

use super::{HandlerError, RequestContext, RowFilterHandler, required_str_arg};

/// Domain plugin: enumerate the user's registered assets from the REC
/// registry and filter with `column IN (owned sensor ids)`.
///
/// Enabled through the plugin list; the registry base URL comes from the
/// environment or from `args.url`.
pub struct RecRegistryHandler {
    http: reqwest::Client,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssetPage {
    #[serde(default)]
    items: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    #[serde(default)]
    sensor_id: Option<String>,
}

impl RecRegistryHandler {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl RowFilterHandler for RecRegistryHandler {
    fn name(&self) -> &'static str {
        "rec_registry"
    }

    async fn resolve(
        &self,
        table: &str,
        user: &AuthenticatedUser,
        args: &serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext<'_>,
    ) -> Result<RowFilterPlan, HandlerError> {
        let column = required_str_arg(args, "column", self.name())?;
        let base_url = args
            .get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| self.base_url.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                HandlerError::BadSpec("rec_registry requires a base url".to_string())
            })?;

        let url = format!("{}/assets/my", base_url.trim_end_matches('/'));
        let page: AssetPage = self
            .http
            .get(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", user.token()),
            )
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(dataset = %ctx.dataset_id, error = %e, "REC registry request failed");
                HandlerError::Upstream(e.to_string())
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::error!(dataset = %ctx.dataset_id, error = %e, "REC registry returned invalid JSON");
                HandlerError::Upstream(e.to_string())
            })?;

        let sensor_ids: Vec<String> = page
            .items
            .into_iter()
            .filter_map(|asset| asset.sensor_id)
            .collect();

        if sensor_ids.is_empty() {
            return Err(HandlerError::Upstream(
                "failed to enumerate user assets".to_string(),
            ));
        }

        tracing::debug!(user = %user.sub, assets = sensor_ids.len(), "REC registry assets resolved");

        let count = sensor_ids.len();
        let list: Vec<Expr> = sensor_ids
            .into_iter()
            .map(|id| Expr::Value(Value::SingleQuotedString(id)))
            .collect();
        let predicate = Expr::InList {
            expr: Box::new(Expr::Identifier(Ident::new(column))),
            list,
            negated: false,
        };

        Ok(RowFilterPlan::predicate(table, predicate)
            .with_meta(serde_json::json!({"items": count})))
    }
}
