use axum::{extract::State, http::StatusCode, Json};
use pollcast_core::AppState;
use serde_json::{json, Value};

use crate::error::ApiError;

/// Mint a token for a fresh anonymous identity.
pub async fn anonymous(State(state): State<AppState>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let issued = pollcast_core::auth::issue_anonymous_token(
        &state.config.jwt_secret,
        state.config.jwt_expiry_seconds,
    )?;
    tracing::debug!(user_id = %issued.user_id, "auth: issued anonymous identity");
    Ok((
        StatusCode::OK,
        Json(json!({
            "token": issued.token,
            "userId": issued.user_id,
            "expiresIn": issued.expires_in,
        })),
    ))
}
