use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// Client-visible error kinds. Every fallible boundary in the gateway
/// returns one of these; translation to HTTP happens exactly once, in
/// `IntoResponse`. Messages are short, stable and safe to show to clients —
/// internal detail goes to the log, never into the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// 400 — grammar violation, unknown datasets, statement timeout, ...
    InvalidRequest(String),
    /// 401 — missing or invalid bearer token
    Unauthenticated(String),
    /// 403 — policy deny or hidden dataset
    Forbidden(String),
    /// 404 — dataset id absent
    NotFound(String),
    /// 500 — misconfigured catalogue entry or internal failure
    Config(String),
    /// 503 — policy engine or row-filter upstream unavailable
    Upstream(String),
}

impl GatewayError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::InvalidRequest(m)
            | GatewayError::Unauthenticated(m)
            | GatewayError::Forbidden(m)
            | GatewayError::NotFound(m)
            | GatewayError::Config(m)
            | GatewayError::Upstream(m) => m,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message() });
        (self.status(), Json(body)).into_response()
    }
}
