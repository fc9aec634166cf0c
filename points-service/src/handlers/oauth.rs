//! OAuth 2.0 authorization-code endpoints for partner clients.
//!
//! Flow:
//! - `GET /oauth/authorize` validates the client and redirect, records a
//!   pending authorization and sends the browser to login or consent
//! - `POST /oauth/consent` issues the code and redirects back to the partner
//! - `POST /oauth/token` exchanges codes and rotates refresh tokens
//!
//! Token, userinfo and revoke fail with RFC 6749 error bodies.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Form, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use service_core::error::AppError;

use crate::dtos::oauth::{
    AuthorizeQuery, ConsentDecision, ConsentQuery, ConsentView, RevokeRequest, TokenRequest,
    TokenResponse, UserInfoResponse,
};
use crate::dtos::Envelope;
use crate::middleware::{bearer_token, OptionalSession, SessionMember};
use crate::models::Scope;
use crate::services::{OAuthError, ServiceError};
use crate::AppState;

/// Append query parameters to a registered redirect URI.
fn redirect_with(base: &str, params: &[(&str, Option<&str>)]) -> Redirect {
    let query = params
        .iter()
        .filter_map(|(key, value)| value.map(|v| format!("{}={}", key, urlencoding::encode(v))))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if base.contains('?') { '&' } else { '?' };
    Redirect::to(&format!("{}{}{}", base, separator, query))
}

fn redirect_error(
    redirect_uri: &str,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> Redirect {
    redirect_with(
        redirect_uri,
        &[
            ("error", Some(error)),
            ("error_description", Some(description)),
            ("state", state),
        ],
    )
}

/// Start an authorization-code grant
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 303, description = "Redirect to login, consent or the partner callback"),
        (status = 400, description = "Unknown client or unregistered redirect URI", body = crate::dtos::OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn authorize(
    State(state): State<AppState>,
    OptionalSession(session): OptionalSession,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, OAuthError> {
    let client_id = query
        .client_id
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("client_id is required"))?;
    let redirect_uri = query
        .redirect_uri
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("redirect_uri is required"))?;

    // Until client and redirect are known good, errors go to the browser directly.
    let client = state
        .grants
        .validate_client(client_id, None)
        .await
        .map_err(|e| match e {
            ServiceError::NotFound(_) => OAuthError::invalid_request("Unknown client"),
            other => other.into(),
        })?;

    let redirect_state = query.state.as_deref();
    match state
        .grants
        .check_authorization_request(&client, redirect_uri)
    {
        Ok(()) => {}
        Err(ServiceError::InvalidRedirect) => {
            tracing::warn!(client_id = %client_id, "Authorization with unregistered redirect URI");
            return Err(OAuthError::invalid_request(
                "redirect_uri is not registered for this client",
            ));
        }
        Err(e) => {
            let err = OAuthError::from(e);
            return Ok(
                redirect_error(redirect_uri, err.error, &err.description, redirect_state)
                    .into_response(),
            );
        }
    }

    if query.response_type.as_deref() != Some("code") {
        return Ok(redirect_error(
            redirect_uri,
            "unsupported_response_type",
            "Only response_type=code is supported",
            redirect_state,
        )
        .into_response());
    }

    let scopes = match state.grants.resolve_scopes(&client, query.scope.as_deref()) {
        Ok(scopes) => scopes,
        Err(e) => {
            let err = OAuthError::from(e);
            return Ok(
                redirect_error(redirect_uri, err.error, &err.description, redirect_state)
                    .into_response(),
            );
        }
    };

    let pending = state.sessions.begin_authorization(
        &client,
        redirect_uri.to_string(),
        scopes,
        query.state.clone(),
        session.as_ref().map(|s| s.member_id),
    );
    let consent = format!(
        "{}?request_id={}",
        state.config.oauth.consent_url,
        urlencoding::encode(&pending.request_id)
    );

    let target = match session {
        Some(_) => Redirect::to(&consent),
        None => redirect_with(&state.config.oauth.login_url, &[("return_to", Some(consent.as_str()))]),
    };
    Ok(target.into_response())
}

/// Describe a pending authorization for the consent renderer
#[utoipa::path(
    get,
    path = "/oauth/consent",
    params(ConsentQuery),
    responses(
        (status = 200, description = "Pending authorization", body = ConsentView),
        (status = 401, description = "No member session", body = crate::dtos::ErrorResponse),
        (status = 403, description = "Request is bound to another member", body = crate::dtos::ErrorResponse),
        (status = 404, description = "Unknown or expired request", body = crate::dtos::ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn consent_view(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
    Query(query): Query<ConsentQuery>,
) -> Result<Envelope<ConsentView>, AppError> {
    let pending = state
        .sessions
        .pending_authorization(&query.request_id, session.member_id)?;
    Ok(Envelope::new(ConsentView::from(pending)))
}

/// Approve or deny a pending authorization
#[utoipa::path(
    post,
    path = "/oauth/consent",
    request_body(content = ConsentDecision, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Redirect to the partner callback with code or error"),
        (status = 401, description = "No member session", body = crate::dtos::ErrorResponse),
        (status = 403, description = "Request is bound to another member", body = crate::dtos::ErrorResponse),
        (status = 404, description = "Unknown, expired or already decided request", body = crate::dtos::ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn consent_decide(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
    Form(decision): Form<ConsentDecision>,
) -> Result<Redirect, AppError> {
    let pending = state
        .sessions
        .take_authorization(&decision.request_id, session.member_id)?;
    let redirect_state = pending.state.as_deref();

    if !decision.approve {
        tracing::info!(member_id = %session.member_id, client_id = %pending.client_id, "Authorization denied by member");
        return Ok(redirect_error(
            &pending.redirect_uri,
            "access_denied",
            "The member denied the request",
            redirect_state,
        ));
    }

    let issued = match state.grants.validate_client(&pending.client_id, None).await {
        Ok(client) => {
            state
                .grants
                .issue_authorization_code(
                    &client,
                    session.member_id,
                    &pending.redirect_uri,
                    pending.scopes.clone(),
                )
                .await
        }
        Err(e) => Err(e),
    };

    match issued {
        Ok(code) => Ok(redirect_with(
            &pending.redirect_uri,
            &[("code", Some(code.as_str())), ("state", redirect_state)],
        )),
        Err(e) => {
            let err = OAuthError::from(e);
            Ok(redirect_error(
                &pending.redirect_uri,
                err.error,
                &err.description,
                redirect_state,
            ))
        }
    }
}

/// Form or JSON body, by content type. An empty body is all defaults.
fn parse_body<T: DeserializeOwned + Default>(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, OAuthError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_slice(body)
            .map_err(|e| OAuthError::invalid_request(format!("Malformed JSON body: {}", e)))
    } else {
        serde_urlencoded::from_bytes(body)
            .map_err(|e| OAuthError::invalid_request(format!("Malformed form body: {}", e)))
    }
}

struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

/// `client_id:client_secret` from HTTP Basic auth.
fn basic_credentials(headers: &HeaderMap) -> Result<Option<ClientCredentials>, OAuthError> {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return Ok(None);
    };

    let decoded = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(OAuthError::invalid_client)?;
    let (id, secret) = decoded.split_once(':').ok_or_else(OAuthError::invalid_client)?;
    let id = urlencoding::decode(id).map_err(|_| OAuthError::invalid_client())?;
    let secret = urlencoding::decode(secret).map_err(|_| OAuthError::invalid_client())?;

    Ok(Some(ClientCredentials {
        client_id: id.into_owned(),
        client_secret: secret.into_owned(),
    }))
}

/// Client authentication from Basic auth or body fields, never both.
fn client_credentials(
    headers: &HeaderMap,
    body_id: Option<String>,
    body_secret: Option<String>,
) -> Result<ClientCredentials, OAuthError> {
    match (basic_credentials(headers)?, body_id, body_secret) {
        (Some(_), _, Some(_)) => Err(OAuthError::invalid_request(
            "Client credentials supplied more than once",
        )),
        (Some(basic), Some(id), None) if id != basic.client_id => Err(
            OAuthError::invalid_request("client_id does not match the authenticated client"),
        ),
        (Some(basic), _, None) => Ok(basic),
        (None, Some(client_id), Some(client_secret)) => Ok(ClientCredentials {
            client_id,
            client_secret,
        }),
        (None, _, _) => Err(OAuthError::invalid_client()),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{} is required", name)))
}

/// Exchange an authorization code or rotate a refresh token
#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token pair issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = crate::dtos::OAuthErrorResponse),
        (status = 401, description = "Client authentication failed", body = crate::dtos::OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TokenResponse>, OAuthError> {
    let req: TokenRequest = parse_body(&headers, &body)?;
    let grant_type = required(req.grant_type, "grant_type")?;
    let credentials = client_credentials(&headers, req.client_id, req.client_secret)?;

    let grant = match grant_type.as_str() {
        "authorization_code" => {
            let code = required(req.code, "code")?;
            let redirect_uri = required(req.redirect_uri, "redirect_uri")?;
            state
                .grants
                .exchange_code(
                    &code,
                    &credentials.client_id,
                    &credentials.client_secret,
                    &redirect_uri,
                )
                .await?
        }
        "refresh_token" => {
            let refresh_token = required(req.refresh_token, "refresh_token")?;
            state
                .grants
                .refresh(
                    &refresh_token,
                    &credentials.client_id,
                    &credentials.client_secret,
                )
                .await?
        }
        other => return Err(OAuthError::unsupported_grant_type(other)),
    };

    Ok(Json(TokenResponse::from(grant)))
}

/// Scope-gated claims about the member behind a bearer token
#[utoipa::path(
    get,
    path = "/oauth/userinfo",
    responses(
        (status = 200, description = "Member claims", body = UserInfoResponse),
        (status = 401, description = "Missing, invalid or expired token", body = crate::dtos::OAuthErrorResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserInfoResponse>, OAuthError> {
    let token =
        bearer_token(&headers).ok_or_else(|| OAuthError::invalid_token("Bearer token required"))?;
    let access = state.grants.validate_access_token(token).await?;

    let member = state
        .store
        .find_member(access.member_id)
        .await?
        .filter(|m| m.active)
        .ok_or_else(|| OAuthError::invalid_token("Token subject no longer exists"))?;

    let profile = access.scopes.contains(Scope::Profile);
    Ok(Json(UserInfoResponse {
        sub: member.member_id.to_string(),
        email: profile.then(|| member.email.clone()),
        name: if profile { member.display_name.clone() } else { None },
        points_balance: access
            .scopes
            .contains(Scope::BalanceRead)
            .then_some(member.points_balance),
        scope: access.scopes.to_string(),
    }))
}

/// Revoke an access or refresh token
#[utoipa::path(
    post,
    path = "/oauth/revoke",
    request_body(content = RevokeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked or unknown"),
        (status = 401, description = "Client authentication failed", body = crate::dtos::OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, OAuthError> {
    let req: RevokeRequest = parse_body(&headers, &body)?;
    let credentials = client_credentials(&headers, req.client_id, req.client_secret)?;
    let token = required(req.token, "token")?;

    state
        .grants
        .revoke(&token, &credentials.client_id, &credentials.client_secret)
        .await?;
    Ok(StatusCode::OK)
}
