use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::LedgerEntry;
use crate::services::{GatedDebitRequest, Mutation, Reconciliation};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RedeemRequest {
    #[schema(value_type = String, example = "50")]
    pub amount: Decimal,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    #[schema(example = "Large latte")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub success: bool,
    #[schema(value_type = String, example = "150")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub new_balance: Decimal,
    pub transaction_id: Uuid,
    #[schema(value_type = String, example = "50")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub redeemed_amount: Decimal,
    #[schema(example = "Coffee Partner")]
    pub client: String,
}

impl From<Mutation> for RedeemResponse {
    fn from(mutation: Mutation) -> Self {
        Self {
            success: true,
            new_balance: mutation.new_balance,
            transaction_id: mutation.entry.entry_id,
            redeemed_amount: mutation.entry.amount,
            client: mutation.client_name,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RedemptionRequestBody {
    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,
    #[validate(length(min = 1, message = "client_secret is required"))]
    pub client_secret: String,
    pub member_id: Uuid,
    #[schema(value_type = String, example = "100")]
    pub amount: Decimal,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequestResponse {
    pub request_id: Uuid,
    /// Only present outside production.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "492031")]
    pub otp: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[schema(value_type = String, example = "100")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub amount: Decimal,
}

impl RedemptionRequestResponse {
    pub fn new(request: GatedDebitRequest, expose_otp: bool) -> Self {
        Self {
            request_id: request.request_id,
            otp: expose_otp.then_some(request.otp),
            expires_at: request.expires_at,
            amount: request.amount,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ApproveRedemptionRequest {
    pub request_id: Uuid,
    #[validate(length(equal = 6, message = "OTP must be 6 digits"))]
    #[schema(example = "492031")]
    pub otp: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RejectRedemptionRequest {
    pub request_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionDecisionResponse {
    pub success: bool,
    #[schema(example = "approved")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "50")]
    #[serde(serialize_with = "super::amount::serialize_option")]
    pub new_balance: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
}

impl From<Mutation> for RedemptionDecisionResponse {
    fn from(mutation: Mutation) -> Self {
        Self {
            success: true,
            status: mutation
                .entry
                .status()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            new_balance: Some(mutation.new_balance),
            transaction_id: Some(mutation.entry.entry_id),
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreditRequest {
    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,
    #[validate(length(min = 1, message = "client_secret is required"))]
    pub client_secret: String,
    pub member_id: Uuid,
    #[schema(value_type = String, example = "200")]
    pub amount: Decimal,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
    #[validate(length(max = 100, message = "Reason must be at most 100 characters"))]
    #[schema(example = "purchase")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreditResponse {
    pub success: bool,
    #[schema(value_type = String, example = "200")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub new_balance: Decimal,
    pub transaction_id: Uuid,
}

impl From<Mutation> for CreditResponse {
    fn from(mutation: Mutation) -> Self {
        Self {
            success: true,
            new_balance: mutation.new_balance,
            transaction_id: mutation.entry.entry_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub member_id: Uuid,
    #[schema(value_type = String, example = "150")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub balance: Decimal,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TransactionsQuery {
    #[param(example = 20)]
    pub limit: Option<i64>,
    #[param(example = 0)]
    pub offset: Option<i64>,
}

/// One ledger entry as seen by the member. `status` is null for instant
/// entries.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub transaction_id: Uuid,
    #[schema(value_type = String, example = "50")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub amount: Decimal,
    #[schema(example = "debit")]
    pub direction: String,
    #[schema(example = "redeem")]
    pub method: String,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub description: Option<String>,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<LedgerEntry> for TransactionView {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            transaction_id: entry.entry_id,
            amount: entry.amount,
            direction: entry.direction().to_string(),
            method: entry.method().to_string(),
            status: entry.status().map(|s| s.to_string()),
            reason: entry.reason().map(str::to_string),
            description: entry.description,
            client_id: entry.client_id,
            created_at: entry.created_utc,
            completed_at: entry.completed_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingRedemptionView {
    pub request_id: Uuid,
    #[schema(value_type = String, example = "100")]
    #[serde(serialize_with = "super::amount::serialize")]
    pub amount: Decimal,
    pub client_id: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<LedgerEntry> for PendingRedemptionView {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            request_id: entry.entry_id,
            amount: entry.amount,
            expires_at: entry.gated().map(|g| g.otp_expiry_utc),
            client_id: entry.client_id,
            description: entry.description,
            created_at: entry.created_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResponse {
    pub member_id: Uuid,
    #[schema(value_type = String)]
    #[serde(serialize_with = "super::amount::serialize")]
    pub balance: Decimal,
    #[schema(value_type = String)]
    #[serde(serialize_with = "super::amount::serialize")]
    pub credits: Decimal,
    #[schema(value_type = String)]
    #[serde(serialize_with = "super::amount::serialize")]
    pub debits: Decimal,
    pub consistent: bool,
}

impl From<Reconciliation> for ReconciliationResponse {
    fn from(r: Reconciliation) -> Self {
        Self {
            member_id: r.member_id,
            balance: r.balance,
            credits: r.credits,
            debits: r.debits,
            consistent: r.consistent,
        }
    }
}
