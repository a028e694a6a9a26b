use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use super::cookies::ACCESS_COOKIE;
use crate::error::{AppError, ErrorKind};
use crate::state::AppState;

/// Subject of a valid access token taken from `Authorization: Bearer` or the
/// `access_token` cookie.
pub struct AuthUser(pub Uuid);

/// Like [`AuthUser`], but a missing or invalid token yields `None`.
pub struct MaybeAuthUser(pub Option<Uuid>);

fn bearer(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

fn access_token(parts: &Parts) -> Option<String> {
    bearer(parts)
        .or_else(|| {
            CookieJar::from_headers(&parts.headers)
                .get(ACCESS_COOKIE)
                .map(|c| c.value().to_string())
        })
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = access_token(parts)
            .ok_or_else(|| AppError::new(ErrorKind::Auth, "You are not logged in"))?;

        match state.keys.access.validate(&token, OffsetDateTime::now_utc()) {
            Ok(user_id) => Ok(AuthUser(user_id)),
            Err(e) => {
                warn!(error = %e, "access token rejected");
                Err(AppError::classify(e))
            }
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthUser(
            AuthUser::from_request_parts(parts, state)
                .await
                .ok()
                .map(|AuthUser(id)| id),
        ))
    }
}
