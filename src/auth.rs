// src/auth.rs
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use http::header::AUTHORIZATION;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
}

/// The verified caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn issue_token(secret: &str, id: &str, role: Role, ttl: chrono::Duration) -> Result<String, AppError> {
    let claims = Claims {
        sub: id.to_string(),
        role,
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Unauthorized(format!("Failed to sign token: {e}")))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Identity, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        debug!("Rejected token: {e}");
        AppError::Unauthorized("Invalid or expired token".into())
    })?;

    if data.claims.sub.is_empty() {
        return Err(AppError::Unauthorized("Token has no subject".into()));
    }
    Ok(Identity {
        id: data.claims.sub,
        role: data.claims.role,
    })
}

impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized("Expected a Bearer token".into()))?;

        verify_token(&state.config.jwt_secret, token.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let token = issue_token("s3cret", "u1", Role::Admin, chrono::Duration::hours(1)).unwrap();
        let identity = verify_token("s3cret", &token).unwrap();
        assert_eq!(identity.id, "u1");
        assert!(identity.is_admin());
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        let token = issue_token("s3cret", "u1", Role::User, chrono::Duration::hours(1)).unwrap();
        assert!(matches!(verify_token("other", &token), Err(AppError::Unauthorized(_))));

        let expired = issue_token("s3cret", "u1", Role::User, chrono::Duration::hours(-1)).unwrap();
        assert!(matches!(verify_token("s3cret", &expired), Err(AppError::Unauthorized(_))));
        assert!(matches!(verify_token("s3cret", "garbage"), Err(AppError::Unauthorized(_))));
    }
}
