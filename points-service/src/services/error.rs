use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::fmt;
use thiserror::Error;

use crate::models::RedemptionStatus;

/// Which credential a lifetime check failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    AuthorizationCode,
    AccessToken,
    RefreshToken,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialKind::AuthorizationCode => "Authorization code",
            CredentialKind::AccessToken => "Access token",
            CredentialKind::RefreshToken => "Refresh token",
        })
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Invalid client credentials")]
    InvalidCredentials,

    #[error("Invalid grant: {0}")]
    InvalidGrant(&'static str),

    #[error("Invalid token")]
    InvalidToken,

    #[error("{0} expired")]
    Expired(CredentialKind),

    #[error("Redirect URI does not match the authorization request")]
    RedirectMismatch,

    #[error("Authorization code was issued to another client")]
    ClientMismatch,

    #[error("Redirect URI is not registered for this client")]
    InvalidRedirect,

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Client is not authorized for grant type {0}")]
    UnauthorizedClient(String),

    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("Token lacks required scope {0}")]
    InsufficientScope(&'static str),

    #[error(
        "Insufficient balance: available {}, requested {}",
        .available.normalize(),
        .requested.normalize()
    )]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    #[error("Redemption request already {0}")]
    AlreadyProcessed(RedemptionStatus),

    #[error("One-time code expired")]
    OtpExpired,

    #[error("Invalid one-time code")]
    InvalidOtp,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    #[error("Concurrent update conflict")]
    Contention,

    #[error("One-time code could not be delivered: {0}")]
    Delivery(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Stable machine-readable code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidCredentials => "INVALID_CREDENTIALS",
            ServiceError::InvalidGrant(_) => "INVALID_GRANT",
            ServiceError::InvalidToken => "INVALID_TOKEN",
            ServiceError::Expired(_) => "EXPIRED",
            ServiceError::RedirectMismatch => "REDIRECT_MISMATCH",
            ServiceError::ClientMismatch => "CLIENT_MISMATCH",
            ServiceError::InvalidRedirect => "INVALID_REDIRECT",
            ServiceError::InvalidScope(_) => "INVALID_SCOPE",
            ServiceError::UnauthorizedClient(_) => "UNAUTHORIZED_CLIENT",
            ServiceError::UnsupportedGrantType(_) => "UNSUPPORTED_GRANT_TYPE",
            ServiceError::InsufficientScope(_) => "INSUFFICIENT_SCOPE",
            ServiceError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            ServiceError::InvalidAmount(_) => "INVALID_AMOUNT",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::AlreadyProcessed(_) => "ALREADY_PROCESSED",
            ServiceError::OtpExpired => "OTP_EXPIRED",
            ServiceError::InvalidOtp => "INVALID_OTP",
            ServiceError::InvalidRequest(_) => "BAD_REQUEST",
            ServiceError::AlreadyExists(_) => "CONFLICT",
            ServiceError::Contention => "CONTENTION",
            ServiceError::Delivery(_) => "OTP_DELIVERY_FAILED",
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let err = match err {
            ServiceError::Database(e) => return AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => return AppError::InternalError(e),
            other => other,
        };
        let code = err.code();
        let status = match &err {
            ServiceError::Database(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidCredentials
            | ServiceError::InvalidToken
            | ServiceError::Expired(_) => StatusCode::UNAUTHORIZED,
            ServiceError::InsufficientScope(_)
            | ServiceError::Forbidden(_)
            | ServiceError::UnauthorizedClient(_) => StatusCode::FORBIDDEN,
            ServiceError::AlreadyProcessed(_) | ServiceError::AlreadyExists(_) => {
                StatusCode::CONFLICT
            }
            ServiceError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::OtpExpired => StatusCode::GONE,
            ServiceError::Contention => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Delivery(_) => StatusCode::BAD_GATEWAY,
            ServiceError::InvalidGrant(_)
            | ServiceError::RedirectMismatch
            | ServiceError::ClientMismatch
            | ServiceError::InvalidRedirect
            | ServiceError::InvalidScope(_)
            | ServiceError::UnsupportedGrantType(_)
            | ServiceError::InvalidAmount(_)
            | ServiceError::InvalidOtp
            | ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        AppError::rejected(status, code, err.to_string())
    }
}

/// RFC 6749 error body: `{"error", "error_description"}`.
#[derive(Debug, Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    error_description: String,
}

/// Failure on an OAuth endpoint (token, userinfo, revoke).
#[derive(Debug)]
pub struct OAuthError {
    pub status: StatusCode,
    pub error: &'static str,
    pub description: String,
    /// `WWW-Authenticate` challenge sent with 401/403 responses.
    pub challenge: Option<&'static str>,
}

impl OAuthError {
    pub fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            error,
            description: description.into(),
            challenge: None,
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", description)
    }

    pub fn invalid_client() -> Self {
        Self {
            challenge: Some("Basic realm=\"points\""),
            ..Self::new(
                StatusCode::UNAUTHORIZED,
                "invalid_client",
                "Client authentication failed",
            )
        }
    }

    pub fn invalid_token(description: impl Into<String>) -> Self {
        Self {
            challenge: Some("Bearer error=\"invalid_token\""),
            ..Self::new(StatusCode::UNAUTHORIZED, "invalid_token", description)
        }
    }

    pub fn unsupported_grant_type(grant_type: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            format!("Grant type not supported: {}", grant_type),
        )
    }
}

impl From<ServiceError> for OAuthError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(_) | ServiceError::InvalidCredentials => {
                OAuthError::invalid_client()
            }
            ServiceError::InvalidToken | ServiceError::Expired(CredentialKind::AccessToken) => {
                OAuthError::invalid_token(err.to_string())
            }
            ServiceError::InvalidGrant(_)
            | ServiceError::Expired(_)
            | ServiceError::RedirectMismatch
            | ServiceError::ClientMismatch => {
                OAuthError::new(StatusCode::BAD_REQUEST, "invalid_grant", err.to_string())
            }
            ServiceError::InvalidScope(_) => {
                OAuthError::new(StatusCode::BAD_REQUEST, "invalid_scope", err.to_string())
            }
            ServiceError::UnauthorizedClient(_) => OAuthError::new(
                StatusCode::BAD_REQUEST,
                "unauthorized_client",
                err.to_string(),
            ),
            ServiceError::UnsupportedGrantType(grant_type) => {
                OAuthError::unsupported_grant_type(&grant_type)
            }
            ServiceError::InsufficientScope(_) => OAuthError {
                challenge: Some("Bearer error=\"insufficient_scope\""),
                ..OAuthError::new(StatusCode::FORBIDDEN, "insufficient_scope", err.to_string())
            },
            ServiceError::Forbidden(_) => {
                OAuthError::new(StatusCode::FORBIDDEN, "access_denied", err.to_string())
            }
            ServiceError::Contention => OAuthError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
                err.to_string(),
            ),
            ServiceError::Database(_) | ServiceError::Internal(_) => {
                tracing::error!(error = %err, "OAuth endpoint failure");
                OAuthError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    "Internal server error",
                )
            }
            other => OAuthError::invalid_request(other.to_string()),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let body = OAuthErrorBody {
            error: self.error,
            error_description: self.description,
        };
        let mut res = (self.status, Json(body)).into_response();
        if let Some(challenge) = self.challenge {
            res.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        }
        res
    }
}
