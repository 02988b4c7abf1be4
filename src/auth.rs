//! Token issuing, verification, and the auth middleware.
//!
//! Three token kinds, all HS256 over the same secret:
//!
//! - **access** — browser tokens, 1 hour expiry
//! - **refresh** — rotated via `POST /api/v1/auth/refresh`, 30 days, persisted
//! - **agent** — service tokens for tunnel agents, no expiry (the `exp`
//!   claim is absent; an expired access token still fails validation)
//!
//! The middleware accepts any verifiable token carrying a `user_id` claim
//! and stashes the id as a request extension.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// Access-token lifetime: one hour.
const ACCESS_TOKEN_TTL_SECS: i64 = 60 * 60;
/// Refresh-token lifetime: thirty days.
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// JWT claims. `exp` is omitted entirely for agent service tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// The authenticated caller, inserted by [`require_auth`].
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser {
    pub user_id: Uuid,
}

fn sign(secret: &str, claims: &Claims) -> Result<String, ApiError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("Failed to sign token: {e}")))
}

/// Browser access token, 1 hour.
pub fn issue_access_token(secret: &str, user_id: Uuid) -> Result<String, ApiError> {
    let now = chrono::Utc::now().timestamp();
    sign(
        secret,
        &Claims {
            user_id: user_id.to_string(),
            iat: now,
            exp: Some(now + ACCESS_TOKEN_TTL_SECS),
            token_type: "access".to_string(),
        },
    )
}

/// Refresh token, 30 days. The caller persists it alongside its expiry.
pub fn issue_refresh_token(secret: &str, user_id: Uuid) -> Result<String, ApiError> {
    let now = chrono::Utc::now().timestamp();
    sign(
        secret,
        &Claims {
            user_id: user_id.to_string(),
            iat: now,
            exp: Some(now + REFRESH_TOKEN_TTL_SECS),
            token_type: "refresh".to_string(),
        },
    )
}

/// Non-expiring agent service token.
pub fn issue_agent_token(secret: &str, user_id: Uuid) -> Result<String, ApiError> {
    sign(
        secret,
        &Claims {
            user_id: user_id.to_string(),
            iat: chrono::Utc::now().timestamp(),
            exp: None,
            token_type: "agent".to_string(),
        },
    )
}

/// Verify signature and expiry (when present) and return the claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::default();
    // Agent tokens carry no `exp`; tokens that do carry one are still
    // checked against the clock.
    validation.required_spec_claims.clear();
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized("Invalid token".to_string()))
}

/// Axum middleware requiring `Authorization: Bearer <token>` with a valid
/// access or agent token. Inserts [`AuthedUser`] for downstream handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let token = match header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return Err(ApiError::Unauthorized(
                "Missing or invalid Authorization header".to_string(),
            ))
        }
    };

    let claims = verify_token(&state.config.auth.jwt_secret, token)?;
    let user_id = Uuid::parse_str(&claims.user_id)
        .map_err(|_| ApiError::Unauthorized("Invalid token claims".to_string()))?;

    request.extensions_mut().insert(AuthedUser { user_id });
    Ok(next.run(request).await)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot learn the secret's length from
/// response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn access_token_roundtrips() {
        let user_id = Uuid::new_v4();
        let token = issue_access_token(SECRET, user_id).unwrap();
        let claims = verify_token(SECRET, &token).unwrap();
        assert_eq!(claims.user_id, user_id.to_string());
        assert_eq!(claims.token_type, "access");
        assert!(claims.exp.is_some());
    }

    #[test]
    fn agent_token_has_no_expiry_and_verifies() {
        let token = issue_agent_token(SECRET, Uuid::new_v4()).unwrap();
        let claims = verify_token(SECRET, &token).unwrap();
        assert_eq!(claims.token_type, "agent");
        assert!(claims.exp.is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = chrono::Utc::now().timestamp();
        let token = sign(
            SECRET,
            &Claims {
                user_id: Uuid::new_v4().to_string(),
                iat: now - 7200,
                exp: Some(now - 3600),
                token_type: "access".to_string(),
            },
        )
        .unwrap();
        assert!(verify_token(SECRET, &token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
        assert!(verify_token("other-secret", &token).is_err());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrex"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
