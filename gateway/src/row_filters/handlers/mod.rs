use async_trait::async_trait;

use crate::auth::AuthenticatedUser;
use crate::row_filters::RowFilterPlan;

pub mod direct_user_match;
pub mod http_in_list;
pub mod rec_registry;
pub mod table_pointer;

pub use direct_user_match::DirectUserMatchHandler;
pub use http_in_list::HttpInListHandler;
pub use rec_registry::RecRegistryHandler;
pub use table_pointer::TablePointerHandler;

/// Handler failure modes and how they surface to clients:
/// a bad governance spec is a configuration error (500), an unreachable or
/// misbehaving upstream fails closed as 503.
#[derive(Debug)]
pub enum HandlerError {
    BadSpec(String),
    Upstream(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::BadSpec(msg) => write!(f, "invalid row filter spec: {msg}"),
            HandlerError::Upstream(msg) => write!(f, "row filter upstream error: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Per-request context passed to handlers, for logging and diagnostics.
pub struct RequestContext<'a> {
    pub dataset_id: &'a str,
}

/// A row-filter handler resolves a governance spec into a `RowFilterPlan`
/// for one physical table and one authenticated user.
#[async_trait]
pub trait RowFilterHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        table: &str,
        user: &AuthenticatedUser,
        args: &serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext<'_>,
    ) -> Result<RowFilterPlan, HandlerError>;
}

pub(crate) fn required_str_arg(
    args: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    handler: &str,
) -> Result<String, HandlerError> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(HandlerError::BadSpec(format!(
            "{handler} requires args.{key}"
        ))),
    }
}
