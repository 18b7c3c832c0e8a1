//! Bearer credential verification.
//!
//! Tokens are issued by the account service as HS256 JWTs whose claims carry
//! the user id under `userId`. This service only verifies them.

use crate::error::{AppError, AppResult};
use crate::models::UserId;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const TOKEN_COOKIE: &str = "jwt";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: UserId,
    pub exp: i64,
}

pub trait Authenticator: Send + Sync {
    /// Verify a credential and return the user it identifies.
    fn authenticate(&self, token: &str) -> AppResult<UserId>;
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> AppResult<UserId> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            AppError::Unauthorized(format!("Invalid token: {}", e))
        })?;

        if data.claims.user_id.trim().is_empty() {
            return Err(AppError::Unauthorized("Token has no user".to_string()));
        }
        Ok(data.claims.user_id)
    }
}

/// Sign a token the way the account service does. Used by tests and tooling.
pub fn issue_token(secret: &str, user_id: &str, ttl: chrono::Duration) -> AppResult<String> {
    let claims = Claims {
        user_id: user_id.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

fn cookie_regex() -> &'static Regex {
    static COOKIE: OnceLock<Regex> = OnceLock::new();
    COOKIE.get_or_init(|| Regex::new(r"(?:^|;\s*)jwt=([^;]+)").expect("valid cookie regex"))
}

/// Find the credential in a request: `Authorization: Bearer ..` first, then
/// the `jwt` cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookies| {
            cookie_regex()
                .captures(cookies)
                .and_then(|captures| captures.get(1))
                .map(|token| token.as_str().trim().to_string())
        })
        .filter(|token| !token.is_empty())
}
