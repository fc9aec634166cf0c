//! Member registration and session handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::error::AppError;

use crate::dtos::session::{
    LoginRequest, LoginResponse, MessageResponse, RegisterRequest, RegisterResponse,
};
use crate::dtos::Envelope;
use crate::middleware::{SessionMember, SESSION_COOKIE};
use crate::models::Member;
use crate::services::ServiceError;
use crate::utils::{
    hash_password, normalize_email, verify_password, Password, PasswordHashString, ValidatedJson,
};
use crate::AppState;

/// Register a member account
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Member registered", body = RegisterResponse),
        (status = 409, description = "Email already registered", body = crate::dtos::ErrorResponse),
        (status = 422, description = "Validation error", body = crate::dtos::ErrorResponse)
    ),
    tag = "Session"
)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email = normalize_email(&req.email);
    if state.store.find_member_by_email(&email).await?.is_some() {
        return Err(ServiceError::AlreadyExists("Member").into());
    }

    let password = Password::new(req.password);
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Hashing task failed: {}", e)))??;

    let member = Member::new(
        email,
        req.display_name.filter(|n| !n.trim().is_empty()),
        password_hash.into_string(),
    );
    state.store.insert_member(&member).await?;

    tracing::info!(member_id = %member.member_id, "Member registered");

    Ok((
        StatusCode::CREATED,
        Envelope::new(RegisterResponse {
            member_id: member.member_id,
            email: member.email,
        }),
    ))
}

/// Log in and start a member session
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session started", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = crate::dtos::ErrorResponse),
        (status = 429, description = "Too many attempts", body = crate::dtos::ErrorResponse)
    ),
    tag = "Session"
)]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let member = state
        .store
        .find_member_by_email(&normalize_email(&req.email))
        .await?
        .filter(|m| m.active)
        .ok_or(ServiceError::InvalidCredentials)?;

    let password = Password::new(req.password);
    let stored = PasswordHashString::new(member.password_hash.clone());
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Hashing task failed: {}", e)))??;
    if !verified {
        tracing::warn!(member_id = %member.member_id, "Login failed: wrong password");
        return Err(ServiceError::InvalidCredentials.into());
    }

    let session = state.sessions.create_session(member.member_id);
    let cookie = Cookie::build((SESSION_COOKIE, session.session_id.clone()))
        .path("/")
        .http_only(true)
        .secure(state.config.security.cookie_secure)
        .same_site(SameSite::Lax);

    Ok((
        jar.add(cookie),
        Envelope::new(LoginResponse {
            member_id: member.member_id,
            session_id: session.session_id,
            expires_at: session.expiry_utc,
        }),
    ))
}

/// End the current member session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "No active session", body = crate::dtos::ErrorResponse)
    ),
    tag = "Session"
)]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    SessionMember(session): SessionMember,
) -> impl IntoResponse {
    state.sessions.end_session(&session.session_id);
    tracing::info!(member_id = %session.member_id, "Member logged out");

    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Envelope::new(MessageResponse {
            message: "Logged out".to_string(),
        }),
    )
}
