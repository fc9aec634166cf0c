pub mod oauth;
pub mod points;
pub mod session;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Points amounts are written in canonical form (`"50"`, `"49.5"`) whatever
/// scale the store hands back.
pub mod amount {
    use rust_decimal::Decimal;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.normalize())
    }

    pub fn serialize_option<S: Serializer>(
        value: &Option<Decimal>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.collect_str(&value.normalize()),
            None => serializer.serialize_none(),
        }
    }
}

/// Success wrapper for every non-OAuth endpoint: `{"data": ...}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[schema(example = "Insufficient balance: available 50, requested 100")]
    pub message: String,
    #[schema(example = "INSUFFICIENT_BALANCE")]
    pub code: String,
    #[schema(example = 422)]
    pub status_code: u16,
}

/// RFC 6749 error body returned by the OAuth endpoints.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OAuthErrorResponse {
    #[schema(example = "invalid_grant")]
    pub error: String,
    #[schema(example = "authorization code already used")]
    pub error_description: String,
}
