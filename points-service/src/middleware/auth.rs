use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use axum_extra::extract::CookieJar;
use service_core::error::AppError;

use crate::models::{AccessToken, MemberSession};
use crate::AppState;

/// Cookie carrying the member session id.
pub const SESSION_COOKIE: &str = "points_session";
/// Header alternative to the cookie for non-browser callers.
pub const SESSION_HEADER: &str = "x-session-id";

/// Raw token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn session_id(parts: &Parts) -> Option<String> {
    CookieJar::from_headers(&parts.headers)
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| {
            parts
                .headers
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .filter(|id| !id.is_empty())
}

/// Extractor for a validated partner access token.
pub struct BearerAuth(pub AccessToken);

#[axum::async_trait]
impl FromRequestParts<AppState> for BearerAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

        let access = state.grants.validate_access_token(token).await?;
        Ok(BearerAuth(access))
    }
}

/// Extractor for the logged-in member, from cookie or `X-Session-Id`.
pub struct SessionMember(pub MemberSession);

impl SessionMember {
    /// Session lookup that does not reject, for endpoints that redirect to
    /// login instead.
    pub fn resolve(parts: &Parts, state: &AppState) -> Option<MemberSession> {
        session_id(parts).and_then(|id| state.sessions.resolve_session(&id))
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for SessionMember {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Self::resolve(parts, state)
            .map(SessionMember)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Member session required")))
    }
}

/// Session that may be absent.
pub struct OptionalSession(pub Option<MemberSession>);

#[axum::async_trait]
impl FromRequestParts<AppState> for OptionalSession {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(OptionalSession(SessionMember::resolve(parts, state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn session_id_prefers_cookie_over_header() {
        let (mut parts, _) = axum::http::Request::builder()
            .header(header::COOKIE, "points_session=from-cookie")
            .header(SESSION_HEADER, "from-header")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(session_id(&parts).as_deref(), Some("from-cookie"));

        parts.headers.remove(header::COOKIE);
        assert_eq!(session_id(&parts).as_deref(), Some("from-header"));
    }
}
