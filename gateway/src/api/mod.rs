use std::sync::Arc;

use axum::{
    Router,
    extract::{FromRef, FromRequestParts},
    http::{HeaderValue, Method, header, request::Parts},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::set_header::response::SetResponseHeaderLayer;

use crate::auth::{AuthenticatedUser, TokenVerifier, extract_bearer};
use crate::catalogue::CatalogueStore;
use crate::config::Settings;
use crate::error::GatewayError;
use crate::policy::PolicyClient;
use crate::row_filters::RowFilterRegistry;

pub mod catalogue_handlers;
pub mod dto;
pub mod query_handlers;

// ---------- shared state ----------

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub catalogue: Arc<CatalogueStore>,
    pub warehouse: deadpool_postgres::Pool,
    pub policy: Arc<PolicyClient>,
    pub row_filters: Arc<RowFilterRegistry>,
    pub verifier: Arc<TokenVerifier>,
}

// ---------- identity extractor ----------

/// Extractor: bearer token is optional; absent means anonymous, present but
/// invalid means 401. Non-bearer Authorization schemes count as absent.
pub struct OptionalUser(pub Option<AuthenticatedUser>);

impl<S> FromRequestParts<S> for OptionalUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        let Some(header_value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(OptionalUser(None));
        };
        let raw = header_value
            .to_str()
            .map_err(|_| GatewayError::Unauthenticated("Invalid token".to_string()))?;
        let Some(token) = extract_bearer(raw) else {
            return Ok(OptionalUser(None));
        };

        let user = state.verifier.verify(token).await?;
        Ok(OptionalUser(Some(user)))
    }
}

// ---------- router ----------

pub fn router(state: AppState) -> Router {
    let allowed_origins: Vec<HeaderValue> = state
        .settings
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let cors = if allowed_origins.is_empty() {
        CorsLayer::new() // no origins allowed = same-origin only
    } else {
        CorsLayer::new()
            .allow_origin(allowed_origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    };

    Router::new()
        .route("/health", get(catalogue_handlers::health))
        .route("/query", post(query_handlers::query_post))
        .route("/catalogue", get(catalogue_handlers::list_catalogue))
        .route(
            "/catalogue/{dataset_id}/schema",
            get(catalogue_handlers::dataset_schema),
        )
        .route(
            "/admin/catalogue",
            post(catalogue_handlers::import_catalogue),
        )
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .with_state(state)
}
