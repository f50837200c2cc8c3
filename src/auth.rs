use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Resolves the calling user from a bearer JWT, or from `x-user-id` when dev
/// overrides are enabled outside production.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(user_id);
        }
    }

    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token.".to_string()))?;
    let secret = state.config.jwt_secret.as_deref().ok_or_else(|| {
        tracing::error!("JWT_SECRET is not configured; bearer tokens cannot be verified");
        AppError::Unauthorized("Authentication is not configured.".to_string())
    })?;

    user_id_from_token(&token, secret)
}

fn user_id_from_token(token: &str, secret: &str) -> AppResult<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "Rejected bearer token");
        AppError::Unauthorized("Invalid or expired token.".to_string())
    })?;

    let subject = data.claims.sub.trim();
    if subject.is_empty() {
        return Err(AppError::Unauthorized("Token has no subject.".to_string()));
    }
    Ok(subject.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = header_value(headers, "authorization")?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|token| !token.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::{bearer_token, user_id_from_token};

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode")
    }

    #[test]
    fn accepts_signed_token_with_subject() {
        let raw = token("s3cret", json!({ "sub": "user-1", "exp": 4_102_444_800_u64 }));
        assert_eq!(user_id_from_token(&raw, "s3cret").expect("valid"), "user-1");
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        let raw = token("s3cret", json!({ "sub": "user-1", "exp": 4_102_444_800_u64 }));
        assert!(user_id_from_token(&raw, "other").is_err());

        let expired = token("s3cret", json!({ "sub": "user-1", "exp": 1_000_u64 }));
        assert!(user_id_from_token(&expired, "s3cret").is_err());
    }

    #[test]
    fn parses_bearer_scheme_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }
}
