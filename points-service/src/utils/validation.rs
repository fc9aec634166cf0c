use axum::{
    extract::{FromRequest, Request},
    Json,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use validator::Validate;

use crate::services::ServiceError;

/// Largest single mutation accepted by the ledger.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Fractional digits a point amount may carry.
pub const AMOUNT_SCALE: u32 = 2;

/// JSON body extractor that runs `validator` rules before the handler sees it.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Json parse error: {}", e)))?;

        value.validate()?;

        Ok(ValidatedJson(value))
    }
}

/// Accept only strictly positive amounts with at most two fractional digits.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::InvalidAmount(
            "Amount must be greater than zero".to_string(),
        ));
    }
    let normalized = amount.normalize();
    if normalized.scale() > AMOUNT_SCALE {
        return Err(ServiceError::InvalidAmount(format!(
            "Amount may have at most {} decimal places",
            AMOUNT_SCALE
        )));
    }
    if normalized > MAX_AMOUNT {
        return Err(ServiceError::InvalidAmount(format!(
            "Amount may not exceed {}",
            MAX_AMOUNT
        )));
    }
    Ok(normalized)
}

/// Lowercase and trim an email so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn max_amount_is_one_trillion() {
        assert_eq!(MAX_AMOUNT, dec("1000000000000"));
    }

    #[test]
    fn accepts_positive_two_place_amounts() {
        assert_eq!(validate_amount(dec("50")).unwrap(), dec("50"));
        assert_eq!(validate_amount(dec("0.01")).unwrap(), dec("0.01"));
        // trailing zeros do not count against the scale
        assert_eq!(validate_amount(dec("12.5000")).unwrap(), dec("12.5"));
    }

    #[test]
    fn rejects_zero_negative_and_fine_grained_amounts() {
        for raw in ["0", "-1", "0.001", "1000000000000.01"] {
            assert!(
                matches!(validate_amount(dec(raw)), Err(ServiceError::InvalidAmount(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Member@Example.COM "), "member@example.com");
    }
}
