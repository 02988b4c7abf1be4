//! Identity endpoints: signup, login, token refresh, agent tokens, profile.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::auth::{
    issue_access_token, issue_agent_token, issue_refresh_token, verify_token, AuthedUser,
    REFRESH_TOKEN_TTL_SECS,
};
use crate::error::ApiError;
use crate::AppState;

/// Public user row (the password hash never leaves the database layer).
#[derive(Debug, Clone, serde::Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, email, name, created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct AgentAuthRequest {
    pub token: String,
}

fn validate_credentials(email: &str, password: &str) -> Result<(), ApiError> {
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::BadRequest("Invalid email address".to_string()));
    }
    if password.len() < 6 {
        return Err(ApiError::BadRequest(
            "Password must be at least 6 characters".to_string(),
        ));
    }
    Ok(())
}

async fn fetch_user(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

async fn save_refresh_token(pool: &PgPool, user_id: Uuid, token: &str) -> Result<(), sqlx::Error> {
    let expires_at = Utc::now() + Duration::seconds(REFRESH_TOKEN_TTL_SECS);
    sqlx::query(
        "INSERT INTO refresh_tokens (id, user_id, token, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(token)
    .bind(expires_at)
    .execute(pool)
    .await
    .map(|_| ())
}

fn token_pair(secret: &str, user_id: Uuid) -> Result<(String, String), ApiError> {
    Ok((
        issue_access_token(secret, user_id)?,
        issue_refresh_token(secret, user_id)?,
    ))
}

/// `POST /api/v1/auth/signup`
pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignUpRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.name.len() < 2 {
        return Err(ApiError::BadRequest(
            "Name must be at least 2 characters".to_string(),
        ));
    }
    validate_credentials(&req.email, &req.password)?;

    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
            .bind(&req.email)
            .fetch_one(&state.db)
            .await?;
    if exists {
        return Err(ApiError::Conflict(
            "User already exists with this email".to_string(),
        ));
    }

    // bcrypt is deliberately slow; keep it off the async worker threads.
    let password = req.password.clone();
    let password_hash = tokio::task::spawn_blocking(move || {
        bcrypt::hash(password, bcrypt::DEFAULT_COST)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Hashing task failed: {e}")))?
    .map_err(|e| ApiError::Internal(format!("Failed to hash password: {e}")))?;

    let user_id = Uuid::new_v4();
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (id, email, password_hash, name) VALUES ($1, $2, $3, $4) \
         RETURNING {USER_COLUMNS}"
    ))
    .bind(user_id)
    .bind(&req.email)
    .bind(&password_hash)
    .bind(&req.name)
    .fetch_one(&state.db)
    .await?;

    let (token, refresh_token) = token_pair(&state.config.auth.jwt_secret, user_id)?;
    save_refresh_token(&state.db, user_id, &refresh_token).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": token,
            "refresh_token": refresh_token,
            "user": user,
        })),
    ))
}

/// `POST /api/v1/auth/login`
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_credentials(&req.email, &req.password)?;

    // One message for unknown email and wrong password alike.
    let invalid = || ApiError::Unauthorized("Invalid email or password".to_string());

    let row: Option<(Uuid, String)> =
        sqlx::query_as("SELECT id, password_hash FROM users WHERE email = $1")
            .bind(&req.email)
            .fetch_optional(&state.db)
            .await?;
    let (user_id, password_hash) = row.ok_or_else(invalid)?;

    let password = req.password.clone();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
        .await
        .map_err(|e| ApiError::Internal(format!("Hashing task failed: {e}")))?
        .unwrap_or(false);
    if !verified {
        return Err(invalid());
    }

    let user = fetch_user(&state.db, user_id).await?.ok_or_else(invalid)?;
    let (token, refresh_token) = token_pair(&state.config.auth.jwt_secret, user_id)?;
    save_refresh_token(&state.db, user_id, &refresh_token).await?;

    Ok(Json(json!({
        "token": token,
        "refresh_token": refresh_token,
        "user": user,
    })))
}

/// `POST /api/v1/auth/refresh` — rotate a refresh token.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    let row: Option<(Uuid, DateTime<Utc>)> =
        sqlx::query_as("SELECT user_id, expires_at FROM refresh_tokens WHERE token = $1")
            .bind(&req.refresh_token)
            .fetch_optional(&state.db)
            .await?;
    let (user_id, expires_at) =
        row.ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".to_string()))?;

    if Utc::now() > expires_at {
        return Err(ApiError::Unauthorized("Refresh token expired".to_string()));
    }

    let (token, new_refresh_token) = token_pair(&state.config.auth.jwt_secret, user_id)?;

    sqlx::query("DELETE FROM refresh_tokens WHERE token = $1")
        .bind(&req.refresh_token)
        .execute(&state.db)
        .await?;
    save_refresh_token(&state.db, user_id, &new_refresh_token).await?;

    Ok(Json(json!({
        "token": token,
        "refresh_token": new_refresh_token,
    })))
}

/// `POST /api/v1/auth/agent-auth` — exchange a browser token for a
/// non-expiring agent service token.
pub async fn agent_auth(
    State(state): State<AppState>,
    Json(req): Json<AgentAuthRequest>,
) -> Result<Json<Value>, ApiError> {
    let claims = verify_token(&state.config.auth.jwt_secret, &req.token)?;
    let user_id = Uuid::parse_str(&claims.user_id)
        .map_err(|_| ApiError::Unauthorized("Invalid token claims".to_string()))?;

    let user = fetch_user(&state.db, user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    let agent_token = issue_agent_token(&state.config.auth.jwt_secret, user_id)?;

    Ok(Json(json!({
        "valid": true,
        "user": user,
        "agent_token": agent_token,
    })))
}

/// `GET /api/v1/profile` — authenticated.
pub async fn profile(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
) -> Result<Json<User>, ApiError> {
    match fetch_user(&state.db, authed.user_id).await? {
        Some(user) => Ok(Json(user)),
        None => {
            warn!(user_id = %authed.user_id, "token for missing user");
            Err(ApiError::NotFound("User not found".to_string()))
        }
    }
}
