use shared::{
    domain::{AttachmentId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{Credentials, TokenResponse},
};
use storage::{AttachmentStore, Storage, StoredAttachment, UserStore};
use tracing::{info, warn};

pub mod token;

pub use token::{bearer_token, verify_token, AccessError, AuthConfig, AuthenticatedUser};

const MAX_USER_ID_BYTES: usize = 64;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
}

pub async fn signup(ctx: &ApiContext, credentials: Credentials) -> Result<(), ApiError> {
    let user_id = validate_user_id(&credentials.user_id)?;
    if credentials.password.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "password cannot be empty",
        ));
    }

    let cost = ctx.auth.bcrypt_cost;
    let password = credentials.password;
    let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| ApiError::internal(format!("hashing task failed: {e}")))?
        .map_err(|e| ApiError::internal(format!("failed to hash password: {e}")))?;

    let created = ctx
        .storage
        .create_user(&user_id, &password_hash)
        .await
        .map_err(internal)?;
    if !created {
        warn!(%user_id, "signup rejected, user id already exists");
        return Err(ApiError::new(ErrorCode::Conflict, "user id already exists"));
    }
    info!(%user_id, "user signed up");
    Ok(())
}

pub async fn login(ctx: &ApiContext, credentials: Credentials) -> Result<TokenResponse, ApiError> {
    let user_id = UserId(credentials.user_id.trim().to_string());
    let Some(password_hash) = ctx
        .storage
        .password_hash_for(&user_id)
        .await
        .map_err(internal)?
    else {
        warn!(%user_id, "login rejected, unknown user");
        return Err(ApiError::new(ErrorCode::Unauthorized, "user not found"));
    };

    let password = credentials.password;
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
        .await
        .map_err(|e| ApiError::internal(format!("verify task failed: {e}")))?
        .unwrap_or(false);
    if !matches {
        warn!(%user_id, "login rejected, wrong password");
        return Err(ApiError::new(ErrorCode::Unauthorized, "invalid password"));
    }

    let token = token::issue_token(&ctx.auth, &user_id)
        .map_err(|e| ApiError::internal(format!("failed to generate token: {e}")))?;
    info!(%user_id, "login succeeded");
    Ok(TokenResponse { token })
}

pub async fn load_attachment(
    ctx: &ApiContext,
    attachment_id: &AttachmentId,
) -> Result<StoredAttachment, ApiError> {
    ctx.storage
        .load_attachment(attachment_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "file not found"))
}

fn validate_user_id(raw: &str) -> Result<UserId, ApiError> {
    let user_id = raw.trim();
    if user_id.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "user_id cannot be empty",
        ));
    }
    if user_id.len() > MAX_USER_ID_BYTES {
        return Err(ApiError::new(ErrorCode::Validation, "user_id is too long"));
    }
    Ok(UserId(user_id.to_string()))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
