use std::time::Duration;

use async_trait::async_trait;
use sqlparser::ast::{Expr, Ident, Value};

use crate::auth::AuthenticatedUser;
use crate::row_filters::RowFilterPlan;

use super::{HandlerError, RequestContext, RowFilterHandler, required_str_arg};

const DEFAULT_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_MAX_ITEMS: usize = 2000;

/// Row filter: fetch a list of permitted values over HTTP and filter with
/// `column IN (items)`.
///
/// Governance args:
/// - `column`: string (required) target column on the dataset table
/// - `url`: string (required)
/// - `method`: "GET" | "POST" (default "GET")
/// - `headers` / `params` / `json`: objects whose string values support
///   `{sub}` / `{username}` / `{email}` / `{token}` templating
/// - `response_path`: dot path into the JSON response (default: whole body)
/// - `timeout_seconds`: default 5
/// - `max_items`: hard cap for the IN list, default 2000 (truncates)
/// - `empty_means_deny`: default true; false turns an empty list into TRUE
/// - `forward_token`: inject the user's bearer into `Authorization`
pub struct HttpInListHandler {
    http: reqwest::Client,
}

impl HttpInListHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpInListHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RowFilterHandler for HttpInListHandler {
    fn name(&self) -> &'static str {
        "http_in_list"
    }

    async fn resolve(
        &self,
        table: &str,
        user: &AuthenticatedUser,
        args: &serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext<'_>,
    ) -> Result<RowFilterPlan, HandlerError> {
        let column = required_str_arg(args, "column", self.name())?;
        let url = required_str_arg(args, "url", self.name())?;

        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let timeout_seconds = args
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let response_path = args
            .get("response_path")
            .and_then(|v| v.as_str())
            .unwrap_or("$");
        let max_items = args
            .get("max_items")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_ITEMS);
        let empty_means_deny = args
            .get("empty_means_deny")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let forward_token = args
            .get("forward_token")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut request = match method.as_str() {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            other => {
                return Err(HandlerError::BadSpec(format!(
                    "http_in_list unsupported method: {other}"
                )));
            }
        };
        request = request.timeout(Duration::from_secs(timeout_seconds));

        if let Some(headers) = args.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                request = request.header(name.as_str(), render_value_string(value, user));
            }
        }
        if forward_token {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", user.token()),
            );
        }
        if let Some(params) = args.get("params").and_then(|v| v.as_object()) {
            let query: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), render_value_string(v, user)))
                .collect();
            request = request.query(&query);
        }
        if method == "POST" {
            if let Some(body) = args.get("json") {
                request = request.json(&render_value(body, user));
            }
        }

        let payload: serde_json::Value = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(dataset = %ctx.dataset_id, handler = self.name(), error = %e, "Row filter upstream request failed");
                HandlerError::Upstream(e.to_string())
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::error!(dataset = %ctx.dataset_id, handler = self.name(), error = %e, "Row filter upstream returned invalid JSON");
                HandlerError::Upstream(e.to_string())
            })?;

        let items = match extract_path(&payload, response_path) {
            Some(serde_json::Value::Array(items)) => items.clone(),
            Some(serde_json::Value::Null) | None => {
                tracing::warn!(
                    dataset = %ctx.dataset_id,
                    path = response_path,
                    "http_in_list response_path not found"
                );
                Vec::new()
            }
            Some(single) => vec![single.clone()],
        };

        let mut flat: Vec<serde_json::Value> =
            items.into_iter().filter(|v| !v.is_null()).collect();

        if flat.is_empty() {
            if empty_means_deny {
                return Ok(RowFilterPlan::deny(table)
                    .with_meta(serde_json::json!({"reason": "empty_list"})));
            }
            return Ok(RowFilterPlan::predicate(
                table,
                Expr::Value(Value::Boolean(true)),
            ));
        }

        if flat.len() > max_items {
            tracing::warn!(
                dataset = %ctx.dataset_id,
                total = flat.len(),
                max_items,
                "http_in_list truncating permitted value list"
            );
            flat.truncate(max_items);
        }

        let list: Vec<Expr> = flat.iter().map(json_to_literal).collect();
        let count = list.len();
        let predicate = Expr::InList {
            expr: Box::new(Expr::Identifier(Ident::new(column))),
            list,
            negated: false,
        };

        Ok(RowFilterPlan::predicate(table, predicate)
            .with_meta(serde_json::json!({"items": count, "url": url})))
    }
}

fn render_template(input: &str, user: &AuthenticatedUser) -> String {
    input
        .replace("{sub}", &user.sub)
        .replace("{username}", user.username.as_deref().unwrap_or(""))
        .replace("{email}", user.email.as_deref().unwrap_or(""))
        .replace("{token}", user.token())
}

fn render_value(value: &serde_json::Value, user: &AuthenticatedUser) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(render_template(s, user)),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, user)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_value(v, user)).collect())
        }
        other => other.clone(),
    }
}

fn render_value_string(value: &serde_json::Value, user: &AuthenticatedUser) -> String {
    match value {
        serde_json::Value::String(s) => render_template(s, user),
        other => other.to_string(),
    }
}

fn extract_path<'a>(
    payload: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    if path.is_empty() || path == "$" {
        return Some(payload);
    }
    let mut current = payload;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Type the IN-list literals from the response values.
fn json_to_literal(value: &serde_json::Value) -> Expr {
    match value {
        serde_json::Value::Bool(b) => Expr::Value(Value::Boolean(*b)),
        serde_json::Value::Number(n) => Expr::Value(Value::Number(n.to_string(), false)),
        serde_json::Value::String(s) => Expr::Value(Value::SingleQuotedString(s.clone())),
        other => Expr::Value(Value::SingleQuotedString(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row_filters::PlanKind;
    use axum::Router;
    use axum::routing::{get, post};
    use serde_json::json;

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().unwrap().clone()
    }

    fn ctx() -> RequestContext<'static> {
        RequestContext { dataset_id: "ds" }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn template_substitutes_identity_fields() {
        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        assert_eq!(
            render_template("/users/{sub}?u={username}&e={email}", &user),
            "/users/alice?u=alice&e="
        );
    }

    #[test]
    fn path_extraction() {
        let payload = json!({"data": {"ids": [1, 2]}});
        assert_eq!(extract_path(&payload, "$"), Some(&payload));
        assert_eq!(extract_path(&payload, "data.ids"), Some(&json!([1, 2])));
        assert_eq!(extract_path(&payload, "data.missing"), None);
    }

    #[tokio::test]
    async fn builds_typed_in_list_from_response() {
        let base = serve(Router::new().route(
            "/allowed",
            get(|| async { axum::Json(json!({"ids": ["m-1", 7, true]})) }),
        ))
        .await;

        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let plan = HttpInListHandler::new()
            .resolve(
                "public.meters",
                &user,
                &args(json!({
                    "column": "meter_id",
                    "url": format!("{base}/allowed"),
                    "response_path": "ids"
                })),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(
            plan.predicate.unwrap().to_string(),
            "meter_id IN ('m-1', 7, true)"
        );
        assert_eq!(plan.meta["items"], 3);
    }

    #[tokio::test]
    async fn empty_list_denies_by_default() {
        let base = serve(Router::new().route(
            "/allowed",
            get(|| async { axum::Json(json!([])) }),
        ))
        .await;

        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let plan = HttpInListHandler::new()
            .resolve(
                "public.meters",
                &user,
                &args(json!({"column": "meter_id", "url": format!("{base}/allowed")})),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::Deny);
        assert_eq!(plan.meta["reason"], "empty_list");
    }

    #[tokio::test]
    async fn empty_list_with_deny_disabled_is_true_predicate() {
        let base = serve(Router::new().route(
            "/allowed",
            get(|| async { axum::Json(json!([])) }),
        ))
        .await;

        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let plan = HttpInListHandler::new()
            .resolve(
                "public.meters",
                &user,
                &args(json!({
                    "column": "meter_id",
                    "url": format!("{base}/allowed"),
                    "empty_means_deny": false
                })),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::Predicate);
        assert_eq!(plan.predicate.unwrap().to_string(), "true");
    }

    #[tokio::test]
    async fn list_is_truncated_at_max_items() {
        let base = serve(Router::new().route(
            "/allowed",
            get(|| async { axum::Json(json!(["a", "b", "c", "d"])) }),
        ))
        .await;

        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let plan = HttpInListHandler::new()
            .resolve(
                "public.meters",
                &user,
                &args(json!({
                    "column": "meter_id",
                    "url": format!("{base}/allowed"),
                    "max_items": 2
                })),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(plan.predicate.unwrap().to_string(), "meter_id IN ('a', 'b')");
    }

    #[tokio::test]
    async fn post_body_is_templated_and_token_forwarded() {
        let app = Router::new().route(
            "/allowed",
            post(
                |headers: axum::http::HeaderMap, body: axum::Json<serde_json::Value>| async move {
                    assert_eq!(body.0["user"], "alice");
                    let auth = headers.get("authorization").unwrap().to_str().unwrap();
                    assert_eq!(auth, "Bearer test-token-alice");
                    axum::Json(json!(["ok"]))
                },
            ),
        );
        let base = serve(app).await;

        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let plan = HttpInListHandler::new()
            .resolve(
                "public.meters",
                &user,
                &args(json!({
                    "column": "meter_id",
                    "url": format!("{base}/allowed"),
                    "method": "POST",
                    "json": {"user": "{sub}"},
                    "forward_token": true
                })),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(plan.predicate.unwrap().to_string(), "meter_id IN ('ok')");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_upstream_error() {
        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let err = HttpInListHandler::new()
            .resolve(
                "public.meters",
                &user,
                &args(json!({"column": "meter_id", "url": "http://127.0.0.1:9/x"})),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Upstream(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_required_args_are_bad_specs() {
        let user = AuthenticatedUser::for_tests("alice", &[], &[]);
        let handler = HttpInListHandler::new();
        for bad in [
            json!({"url": "http://x"}),
            json!({"column": "c"}),
            json!({"column": "c", "url": "http://x", "method": "DELETE"}),
        ] {
            let err = handler
                .resolve("t", &user, &args(bad), &ctx())
                .await
                .unwrap_err();
            assert!(matches!(err, HandlerError::BadSpec(_)), "{err}");
        }
    }
}
