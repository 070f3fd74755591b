use axum::extract::State;
use axum::response::Json;

use crate::api::dto::QueryRequest;
use crate::api::{AppState, OptionalUser};
use crate::error::GatewayError;
use crate::executor::{QueryOutcome, execute_query};

/// POST /query — run a governed SQL query over catalogued datasets.
pub async fn query_post(
    State(state): State<AppState>,
    OptionalUser(user): OptionalUser,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryOutcome>, GatewayError> {
    let outcome = execute_query(
        &state,
        body.sql.as_deref(),
        body.limit,
        body.offset,
        user.as_ref(),
    )
    .await?;
    Ok(Json(outcome))
}
