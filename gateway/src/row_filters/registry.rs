use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthenticatedUser;
use crate::cache::TtlCache;
use crate::config::Settings;
use crate::entity::dataset_entry;
use crate::error::GatewayError;
use crate::row_filters::handlers::{
    DirectUserMatchHandler, HandlerError, HttpInListHandler, RecRegistryHandler, RequestContext,
    RowFilterHandler, TablePointerHandler,
};
use crate::row_filters::{RowFilterPlan, row_filter_specs};

/// Registry of row-filter handlers plus the shared plan cache.
///
/// Built once at startup and read-only afterwards: built-ins always
/// register, optional plugins are enabled by name through configuration.
/// Duplicate names are fatal at build time.
pub struct RowFilterRegistry {
    handlers: HashMap<String, Arc<dyn RowFilterHandler>>,
    cache: TtlCache<RowFilterPlan>,
    default_ttl: Duration,
    admin_groups: Vec<String>,
}

impl std::fmt::Debug for RowFilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowFilterRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("default_ttl", &self.default_ttl)
            .field("admin_groups", &self.admin_groups)
            .finish()
    }
}

pub struct RowFilterRegistryBuilder {
    handlers: HashMap<String, Arc<dyn RowFilterHandler>>,
}

impl std::fmt::Debug for RowFilterRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowFilterRegistryBuilder")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RowFilterRegistryBuilder {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        handler: Arc<dyn RowFilterHandler>,
    ) -> Result<&mut Self, GatewayError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(GatewayError::Config(format!(
                "Duplicate row filter handler name: {name}"
            )));
        }
        self.handlers.insert(name, handler);
        Ok(self)
    }

    pub fn build(self, settings: &Settings) -> RowFilterRegistry {
        RowFilterRegistry {
            handlers: self.handlers,
            cache: TtlCache::new(settings.row_filter_cache_size),
            default_ttl: settings.row_filter_cache_ttl,
            admin_groups: settings.admin_groups.clone(),
        }
    }
}

impl Default for RowFilterRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RowFilterRegistry {
    /// Register the built-in handlers plus every plugin enabled through
    /// `GW_ROW_FILTER_PLUGINS`. Unknown plugin names abort startup.
    pub fn from_settings(settings: &Settings) -> Result<Self, GatewayError> {
        let mut builder = RowFilterRegistryBuilder::new();
        builder.register(Arc::new(DirectUserMatchHandler))?;
        builder.register(Arc::new(HttpInListHandler::new()))?;
        builder.register(Arc::new(TablePointerHandler))?;

        for plugin in &settings.row_filter_plugins {
            match plugin.as_str() {
                "rec_registry" => {
                    builder.register(Arc::new(RecRegistryHandler::new(
                        settings.rec_registry_url.clone(),
                    )))?;
                }
                unknown => {
                    return Err(GatewayError::Config(format!(
                        "Unknown row filter plugin: {unknown}"
                    )));
                }
            }
            tracing::info!(plugin = %plugin, "Loaded row filter plugin");
        }

        Ok(builder.build(settings))
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn RowFilterHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Users in any configured admin group skip row filtering entirely.
    pub fn is_admin(&self, user: &AuthenticatedUser) -> bool {
        user.groups
            .iter()
            .any(|g| self.admin_groups.iter().any(|admin| admin == g))
    }

    /// Resolve every row-filter spec a dataset declares into plans for its
    /// physical table. Anonymous users against a filtered dataset fail
    /// closed with a deny plan.
    pub async fn plans_for_entry(
        &self,
        entry: &dataset_entry::Model,
        physical_table: &str,
        user: Option<&AuthenticatedUser>,
    ) -> Result<Vec<RowFilterPlan>, GatewayError> {
        let specs = row_filter_specs(entry);
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let user = match user {
            Some(user) if self.is_admin(user) => {
                tracing::debug!(
                    dataset = %entry.dataset_id,
                    user = %user.sub,
                    "Admin group bypasses row filters"
                );
                return Ok(Vec::new());
            }
            Some(user) => user,
            None => {
                tracing::debug!(
                    dataset = %entry.dataset_id,
                    "Row-filtered dataset queried anonymously, denying rows"
                );
                return Ok(vec![RowFilterPlan::deny(physical_table)]);
            }
        };

        let ctx = RequestContext {
            dataset_id: &entry.dataset_id,
        };
        let mut plans = Vec::with_capacity(specs.len());
        for spec in &specs {
            let plan = self
                .resolve_with_cache(&spec.handler, physical_table, user, &spec.args, &ctx)
                .await?;
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Resolve one handler spec, consulting the plan cache first. Within the
    /// TTL an identical `(handler, table, sub, args)` tuple invokes the
    /// handler at most once per process.
    pub async fn resolve_with_cache(
        &self,
        handler_name: &str,
        table: &str,
        user: &AuthenticatedUser,
        args: &serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext<'_>,
    ) -> Result<RowFilterPlan, GatewayError> {
        let handler = self.handler(handler_name).ok_or_else(|| {
            tracing::error!(handler = %handler_name, "Row filter handler not registered");
            GatewayError::Config("Unknown row filter handler".to_string())
        })?;

        // serde_json maps are sorted, so this rendering is canonical.
        let args_key = serde_json::Value::Object(args.clone()).to_string();
        let key = format!("{handler_name}|{table}|{}|{args_key}", user.sub);

        if let Some(plan) = self.cache.get(&key) {
            tracing::debug!(handler = %handler_name, table = %table, "Row filter plan (cached)");
            return Ok(plan);
        }

        let plan = handler
            .resolve(table, user, args, ctx)
            .await
            .map_err(|e| match e {
                HandlerError::BadSpec(detail) => {
                    tracing::error!(
                        handler = %handler_name,
                        dataset = %ctx.dataset_id,
                        detail = %detail,
                        "Invalid row filter spec"
                    );
                    GatewayError::Config("Invalid row filter configuration".to_string())
                }
                HandlerError::Upstream(detail) => {
                    tracing::error!(
                        handler = %handler_name,
                        dataset = %ctx.dataset_id,
                        detail = %detail,
                        "Row filter upstream failure"
                    );
                    GatewayError::Upstream("Row filter service unavailable".to_string())
                }
            })?;

        // Plans derived from the token must not outlive it.
        let ttl = match user.token_remaining_ttl() {
            Some(remaining) => remaining.min(self.default_ttl),
            None => self.default_ttl,
        };
        self.cache.insert(key, plan.clone(), ttl);
        Ok(plan)
    }
}
