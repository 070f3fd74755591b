use std::time::Duration;

/// Runtime configuration, parsed once at startup from `GW_*` environment
/// variables (with `.env` support via dotenvy in `main`).
#[derive(Debug, Clone)]
pub struct Settings {
    /// PostgreSQL URL serving both the catalogue store and the warehouse.
    /// Schema selection for the catalogue goes through the URL's
    /// `search_path` options.
    pub database_url: String,
    pub bind_addr: String,
    /// Warehouse pool capacity. One session per in-flight request.
    pub db_pool_size: usize,

    // OIDC / identity
    pub oidc_jwks_uri: Option<String>,
    pub oidc_issuer: Option<String>,
    pub oidc_audience: Option<String>,
    pub oidc_client_id: Option<String>,
    pub jwks_cache_ttl: Duration,

    // Policy engine
    pub policy_enabled: bool,
    pub policy_url: Option<String>,
    pub policy_package: String,
    pub policy_cache_ttl: Duration,
    pub policy_cache_size: usize,

    // Row filters
    pub row_filter_plugins: Vec<String>,
    pub row_filter_cache_ttl: Duration,
    pub row_filter_cache_size: usize,
    pub admin_groups: Vec<String>,
    pub rec_registry_url: Option<String>,

    // Query execution
    pub default_limit: i64,
    pub max_limit: i64,
    pub statement_timeout_ms: u64,
    pub max_ast_depth: usize,

    pub cors_allowed_origins: Vec<String>,
}

impl Settings {
    /// Defaults for everything except the database URL.
    pub fn defaults(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            bind_addr: "127.0.0.1:8080".to_string(),
            db_pool_size: 16,
            oidc_jwks_uri: None,
            oidc_issuer: None,
            oidc_audience: None,
            oidc_client_id: None,
            jwks_cache_ttl: Duration::from_secs(3600),
            policy_enabled: true,
            policy_url: None,
            policy_package: "dataset/gateway".to_string(),
            policy_cache_ttl: Duration::from_secs(300),
            policy_cache_size: 10_000,
            row_filter_plugins: Vec::new(),
            row_filter_cache_ttl: Duration::from_secs(300),
            row_filter_cache_size: 10_000,
            admin_groups: vec!["admins".to_string()],
            rec_registry_url: None,
            default_limit: 100,
            max_limit: 10_000,
            statement_timeout_ms: 2000,
            max_ast_depth: 50,
            cors_allowed_origins: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        let database_url =
            std::env::var("GW_DATABASE_URL").map_err(|_| "GW_DATABASE_URL is not set".to_string())?;

        let mut s = Self::defaults(database_url);

        if let Ok(v) = std::env::var("GW_BIND_ADDR") {
            s.bind_addr = v;
        }
        s.db_pool_size = env_parse("GW_DB_POOL_SIZE", s.db_pool_size)?;

        s.oidc_jwks_uri = env_opt("GW_OIDC_JWKS_URI");
        s.oidc_issuer = env_opt("GW_OIDC_ISSUER");
        s.oidc_audience = env_opt("GW_OIDC_AUDIENCE");
        s.oidc_client_id = env_opt("GW_OIDC_CLIENT_ID");
        s.jwks_cache_ttl = Duration::from_secs(env_parse("GW_JWKS_CACHE_TTL", 3600u64)?);

        s.policy_enabled = env_parse("GW_POLICY_ENABLED", true)?;
        s.policy_url = env_opt("GW_POLICY_URL");
        if let Ok(v) = std::env::var("GW_POLICY_PACKAGE") {
            s.policy_package = v;
        }
        s.policy_cache_ttl = Duration::from_secs(env_parse("GW_POLICY_CACHE_TTL", 300u64)?);
        s.policy_cache_size = env_parse("GW_POLICY_CACHE_SIZE", s.policy_cache_size)?;

        s.row_filter_plugins = env_list("GW_ROW_FILTER_PLUGINS");
        s.row_filter_cache_ttl =
            Duration::from_secs(env_parse("GW_ROW_FILTER_CACHE_TTL", 300u64)?);
        s.row_filter_cache_size = env_parse("GW_ROW_FILTER_CACHE_SIZE", s.row_filter_cache_size)?;
        if let Ok(v) = std::env::var("GW_ADMIN_GROUPS") {
            s.admin_groups = split_list(&v);
        }
        s.rec_registry_url = env_opt("GW_REC_REGISTRY_URL");

        s.default_limit = env_parse("GW_DEFAULT_LIMIT", s.default_limit)?;
        s.max_limit = env_parse("GW_MAX_LIMIT", s.max_limit)?;
        s.statement_timeout_ms = env_parse("GW_STATEMENT_TIMEOUT_MS", s.statement_timeout_ms)?;
        s.max_ast_depth = env_parse("GW_MAX_AST_DEPTH", s.max_ast_depth)?;

        s.cors_allowed_origins = env_list("GW_CORS_ALLOWED_ORIGINS");

        Ok(s)
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_limits() {
        let s = Settings::defaults("postgres://localhost/db");
        assert_eq!(s.default_limit, 100);
        assert_eq!(s.max_limit, 10_000);
        assert_eq!(s.statement_timeout_ms, 2000);
        assert_eq!(s.max_ast_depth, 50);
        assert!(s.db_pool_size >= 10, "pool must hold at least 10 sessions");
        assert_eq!(s.admin_groups, vec!["admins".to_string()]);
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            split_list(" a, b ,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
