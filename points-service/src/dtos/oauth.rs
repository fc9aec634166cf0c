use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::models::{PendingAuthorization, Scope, TokenGrant};

/// `GET /oauth/authorize` parameters. Everything is optional so that missing
/// fields can be reported as OAuth errors instead of extractor rejections.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeQuery {
    #[param(example = "pc_3f9a1c0d2b7e4a6f8c1d2e3f")]
    pub client_id: Option<String>,
    #[param(example = "https://partner.example/callback")]
    pub redirect_uri: Option<String>,
    #[param(example = "code")]
    pub response_type: Option<String>,
    #[param(example = "profile points:redeem")]
    pub scope: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConsentQuery {
    pub request_id: String,
}

/// What the consent renderer shows the member.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsentView {
    pub request_id: String,
    pub client_id: String,
    #[schema(example = "Coffee Partner")]
    pub client_name: String,
    pub redirect_uri: String,
    pub scopes: Vec<ScopeView>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScopeView {
    #[schema(example = "points:redeem")]
    pub name: &'static str,
    #[schema(example = "Spend your points")]
    pub description: &'static str,
}

impl From<Scope> for ScopeView {
    fn from(scope: Scope) -> Self {
        Self {
            name: scope.as_str(),
            description: scope.description(),
        }
    }
}

impl From<PendingAuthorization> for ConsentView {
    fn from(pending: PendingAuthorization) -> Self {
        Self {
            scopes: pending.scopes.iter().copied().map(ScopeView::from).collect(),
            request_id: pending.request_id,
            client_id: pending.client_id,
            client_name: pending.client_name,
            redirect_uri: pending.redirect_uri,
            expires_at: pending.expiry_utc,
        }
    }
}

/// Member's answer on the consent step, posted as a form.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentDecision {
    pub request_id: String,
    #[serde(default)]
    pub approve: bool,
}

/// `POST /oauth/token` body (form or JSON). Fields are validated per grant.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    #[schema(example = "authorization_code")]
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    /// Seconds until the access token expires; absent for non-expiring tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = 3600)]
    pub expires_in: Option<i64>,
    pub refresh_token: String,
    #[schema(example = "profile points:redeem")]
    pub scope: String,
}

impl From<TokenGrant> for TokenResponse {
    fn from(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            token_type: "Bearer".to_string(),
            expires_in: grant.expires_in,
            refresh_token: grant.refresh_token,
            scope: grant.scopes.to_string(),
        }
    }
}

/// `POST /oauth/revoke` body (form or JSON).
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub token: Option<String>,
    #[schema(example = "refresh_token")]
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Scope-gated member claims.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "150")]
    #[serde(serialize_with = "super::amount::serialize_option")]
    pub points_balance: Option<Decimal>,
    pub scope: String,
}
