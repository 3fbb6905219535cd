use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: String,
    iat: i64,
    exp: i64,
}

/// Identity established by the access gate for one connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("no bearer credential supplied")]
    Missing,
    #[error("credential has expired")]
    Expired,
    #[error("credential is invalid: {0}")]
    Invalid(jsonwebtoken::errors::Error),
}

pub fn issue_token(
    cfg: &AuthConfig,
    user_id: &UserId,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.token_ttl_seconds);
    let claims = Claims {
        user_id: user_id.0.clone(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
}

/// Stateless HS256 verification against the shared secret.
pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<AuthenticatedUser, AccessError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AccessError::Missing);
    }
    let mut validation = Validation::default();
    validation.leeway = 0;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AccessError::Expired,
        _ => AccessError::Invalid(e),
    })?;

    if data.claims.user_id.trim().is_empty() {
        return Err(AccessError::Missing);
    }
    Ok(AuthenticatedUser {
        user_id: UserId(data.claims.user_id),
    })
}

/// Picks the credential from an `Authorization: Bearer` header, falling back
/// to the `token` query parameter.
pub fn bearer_token<'a>(
    authorization: Option<&'a str>,
    query_token: Option<&'a str>,
) -> Option<&'a str> {
    authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
}

#[cfg(test)]
#[path = "tests/token_tests.rs"]
mod tests;
