//! Bearer token issuance and verification.
//!
//! No full auth middleware stack is in scope (SPEC_FULL.md §1), but the
//! HTTP surface still needs a real, working bearer token so `/auth/login`
//! and the `Extension<CurrentUser>` extractor are reachable end to end. The
//! token is a compact `header.payload.signature` triple, HMAC-SHA256 signed
//! with the configured secret, using the same RustCrypto primitives
//! (`hmac`, `sha2`, `hex`) the teacher's codebase already depends on rather
//! than pulling in a dedicated JWT crate.

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Role;
use crate::server::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    role: Role,
    exp: i64,
}

fn sign(payload: &str, secret: &str) -> AppResultToken<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| e.to_string())?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

type AppResultToken<T> = Result<T, String>;

/// Issues a bearer token for `user_id`/`role`, valid for `expire_minutes`.
pub fn issue_token(user_id: Uuid, role: Role, secret: &str, expire_minutes: i64) -> String {
    let claims = Claims { sub: user_id, role, exp: Utc::now().timestamp() + expire_minutes * 60 };
    let header = BASE64URL.encode(br#"{"alg":"HS256","typ":"AUTH"}"#);
    let payload = BASE64URL.encode(serde_json::to_vec(&claims).unwrap_or_default());
    let signing_input = format!("{header}.{payload}");
    let signature = sign(&signing_input, secret).unwrap_or_default();
    format!("{signing_input}.{signature}")
}

/// Verifies a bearer token's signature and expiry, returning the subject
/// and role on success.
pub fn verify_token(token: &str, secret: &str) -> Result<(Uuid, Role), AppError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = parts.as_slice() else {
        return Err(AppError::Auth("malformed token".to_string()));
    };
    let signing_input = format!("{header}.{payload}");
    let expected = sign(&signing_input, secret).map_err(AppError::Internal)?;
    if expected != *signature {
        return Err(AppError::Auth("invalid token signature".to_string()));
    }
    let payload_bytes = BASE64URL.decode(payload).map_err(|e| AppError::Auth(e.to_string()))?;
    let claims: Claims = serde_json::from_slice(&payload_bytes).map_err(|e| AppError::Auth(e.to_string()))?;
    if claims.exp < Utc::now().timestamp() {
        return Err(AppError::Auth("token expired".to_string()));
    }
    Ok((claims.sub, claims.role))
}

/// The authenticated principal, attached to request extensions by
/// [`require_auth`] and read by handlers via `Extension<CurrentUser>`.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser {
    pub id: Uuid,
    pub role: Role,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .copied()
            .ok_or_else(|| AppError::Auth("missing authentication".to_string()))
    }
}

/// Resolves the bearer token from the `Authorization` header into a
/// [`CurrentUser`] extension, rejecting the request otherwise. Installed as
/// an Axum `middleware::from_fn_with_state` layer over the protected routes.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Auth("missing Authorization header".to_string()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Auth("Authorization header must use the Bearer scheme".to_string()))?;
    let (user_id, role) = verify_token(token, &state.config.secret_key)?;

    let active: Option<i64> = sqlx::query_scalar("SELECT active FROM users WHERE id = ?")
        .bind(user_id.to_string())
        .fetch_optional(&state.pool)
        .await
        .map_err(AppError::from)?;
    if active != Some(1) {
        return Err(AppError::Auth("user is inactive or no longer exists".to_string()));
    }

    request.extensions_mut().insert(CurrentUser { id: user_id, role });
    Ok(next.run(request).await)
}

/// Returns `()` if `current.role` is admin, else a [`AppError::Permission`].
pub fn require_admin(current: &CurrentUser) -> Result<(), AppError> {
    if current.role == Role::Admin {
        Ok(())
    } else {
        Err(AppError::Permission("admin role required".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_token() {
        let user_id = Uuid::new_v4();
        let token = issue_token(user_id, Role::User, "secret", 60);
        let (sub, role) = verify_token(&token, "secret").unwrap();
        assert_eq!(sub, user_id);
        assert_eq!(role, Role::User);
    }

    #[test]
    fn rejects_tampered_signature() {
        let token = issue_token(Uuid::new_v4(), Role::Admin, "secret", 60);
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(verify_token(&tampered, "secret").is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = issue_token(Uuid::new_v4(), Role::Admin, "secret", 60);
        assert!(verify_token(&token, "other-secret").is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let token = issue_token(Uuid::new_v4(), Role::User, "secret", -1);
        assert!(verify_token(&token, "secret").is_err());
    }
}
