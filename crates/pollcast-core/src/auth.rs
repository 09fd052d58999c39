use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub user_id: String,
    pub expires_in: u64,
}

pub fn create_token(user_id: &str, secret: &str, expiry_seconds: u64) -> Result<String, CoreError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        user_id: user_id.to_string(),
        iat: now,
        exp: now.saturating_add(i64::try_from(expiry_seconds).unwrap_or(i64::MAX)),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| CoreError::Internal(format!("token encoding failed: {e}")))
}

/// Mint a token for a brand-new anonymous identity.
pub fn issue_anonymous_token(secret: &str, expiry_seconds: u64) -> Result<IssuedToken, CoreError> {
    let user_id = Uuid::new_v4().to_string();
    let token = create_token(&user_id, secret, expiry_seconds)?;
    Ok(IssuedToken {
        token,
        user_id,
        expires_in: expiry_seconds,
    })
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, CoreError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| CoreError::InvalidToken)?;
    if data.claims.user_id.trim().is_empty() {
        return Err(CoreError::InvalidToken);
    }
    Ok(data.claims)
}
