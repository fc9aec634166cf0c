use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use service_core::error::AppError;

use crate::dtos::points::{
    ApproveRedemptionRequest, BalanceResponse, CreditRequest, CreditResponse,
    PendingRedemptionView, ReconciliationResponse, RedeemRequest, RedeemResponse,
    RedemptionDecisionResponse, RedemptionRequestBody, RedemptionRequestResponse,
    RejectRedemptionRequest, TransactionView, TransactionsQuery,
};
use crate::dtos::Envelope;
use crate::middleware::{BearerAuth, SessionMember};
use crate::utils::ValidatedJson;
use crate::AppState;

const DEFAULT_PAGE_SIZE: i64 = 20;

/// Spend points with a partner access token
#[utoipa::path(
    post,
    path = "/points/redeem",
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Points redeemed", body = RedeemResponse),
        (status = 400, description = "Invalid amount", body = crate::dtos::ErrorResponse),
        (status = 401, description = "Missing, invalid or expired token", body = crate::dtos::ErrorResponse),
        (status = 403, description = "Token lacks the spend scope", body = crate::dtos::ErrorResponse),
        (status = 422, description = "Insufficient balance", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points",
    security(("bearer_auth" = []))
)]
pub async fn redeem(
    State(state): State<AppState>,
    BearerAuth(token): BearerAuth,
    ValidatedJson(req): ValidatedJson<RedeemRequest>,
) -> Result<Envelope<RedeemResponse>, AppError> {
    let mutation = state
        .ledger
        .apply_instant_debit(&token, req.amount, req.description)
        .await?;
    Ok(Envelope::new(RedeemResponse::from(mutation)))
}

/// Open an OTP-gated redemption request
#[utoipa::path(
    post,
    path = "/points/redemption-request",
    request_body = RedemptionRequestBody,
    responses(
        (status = 201, description = "Request opened, OTP sent to the member", body = RedemptionRequestResponse),
        (status = 401, description = "Client authentication failed", body = crate::dtos::ErrorResponse),
        (status = 422, description = "Insufficient balance", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn request_redemption(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RedemptionRequestBody>,
) -> Result<impl IntoResponse, AppError> {
    let request = state
        .ledger
        .request_gated_debit(
            &req.client_id,
            &req.client_secret,
            req.member_id,
            req.amount,
            req.description,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Envelope::new(RedemptionRequestResponse::new(
            request,
            !state.config.is_prod(),
        )),
    ))
}

/// Approve a pending redemption with its OTP
#[utoipa::path(
    post,
    path = "/points/redemption/approve",
    request_body = ApproveRedemptionRequest,
    responses(
        (status = 200, description = "Redemption approved", body = RedemptionDecisionResponse),
        (status = 400, description = "Invalid OTP", body = crate::dtos::ErrorResponse),
        (status = 403, description = "Request belongs to another member", body = crate::dtos::ErrorResponse),
        (status = 404, description = "Unknown request", body = crate::dtos::ErrorResponse),
        (status = 409, description = "Request already processed", body = crate::dtos::ErrorResponse),
        (status = 410, description = "OTP expired", body = crate::dtos::ErrorResponse),
        (status = 422, description = "Insufficient balance", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn approve_redemption(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
    ValidatedJson(req): ValidatedJson<ApproveRedemptionRequest>,
) -> Result<Envelope<RedemptionDecisionResponse>, AppError> {
    let mutation = state
        .ledger
        .approve_gated_debit(session.member_id, req.request_id, &req.otp)
        .await?;
    Ok(Envelope::new(RedemptionDecisionResponse::from(mutation)))
}

/// Decline a pending redemption
#[utoipa::path(
    post,
    path = "/points/redemption/reject",
    request_body = RejectRedemptionRequest,
    responses(
        (status = 200, description = "Redemption rejected", body = RedemptionDecisionResponse),
        (status = 403, description = "Request belongs to another member", body = crate::dtos::ErrorResponse),
        (status = 409, description = "Request already processed", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn reject_redemption(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
    ValidatedJson(req): ValidatedJson<RejectRedemptionRequest>,
) -> Result<Envelope<RedemptionDecisionResponse>, AppError> {
    let entry = state
        .ledger
        .reject_gated_debit(session.member_id, req.request_id)
        .await?;
    Ok(Envelope::new(RedemptionDecisionResponse {
        success: true,
        status: entry.status().map(|s| s.to_string()).unwrap_or_default(),
        new_balance: None,
        transaction_id: Some(entry.entry_id),
    }))
}

/// Award points to a member
#[utoipa::path(
    post,
    path = "/points/credit",
    request_body = CreditRequest,
    responses(
        (status = 200, description = "Points credited", body = CreditResponse),
        (status = 401, description = "Client authentication failed", body = crate::dtos::ErrorResponse),
        (status = 404, description = "Unknown member", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn credit(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreditRequest>,
) -> Result<Envelope<CreditResponse>, AppError> {
    let mutation = state
        .ledger
        .apply_instant_credit(
            &req.client_id,
            &req.client_secret,
            req.member_id,
            req.amount,
            req.reason,
            req.description,
        )
        .await?;
    Ok(Envelope::new(CreditResponse::from(mutation)))
}

/// Current balance of the logged-in member
#[utoipa::path(
    get,
    path = "/points/balance",
    responses(
        (status = 200, description = "Balance", body = BalanceResponse),
        (status = 401, description = "No member session", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn balance(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
) -> Result<Envelope<BalanceResponse>, AppError> {
    let balance = state.ledger.balance(session.member_id).await?;
    Ok(Envelope::new(BalanceResponse {
        member_id: session.member_id,
        balance,
    }))
}

/// Ledger history, newest first
#[utoipa::path(
    get,
    path = "/points/transactions",
    params(TransactionsQuery),
    responses(
        (status = 200, description = "Ledger entries", body = Vec<TransactionView>),
        (status = 401, description = "No member session", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn transactions(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
    Query(query): Query<TransactionsQuery>,
) -> Result<Envelope<Vec<TransactionView>>, AppError> {
    let entries = state
        .ledger
        .history(
            session.member_id,
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Envelope::new(
        entries.into_iter().map(TransactionView::from).collect(),
    ))
}

/// Redemption requests awaiting the member's decision
#[utoipa::path(
    get,
    path = "/points/redemption/pending",
    responses(
        (status = 200, description = "Pending requests", body = Vec<PendingRedemptionView>),
        (status = 401, description = "No member session", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn pending_redemptions(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
) -> Result<Envelope<Vec<PendingRedemptionView>>, AppError> {
    let entries = state.ledger.pending(session.member_id).await?;
    Ok(Envelope::new(
        entries
            .into_iter()
            .map(PendingRedemptionView::from)
            .collect(),
    ))
}

/// Compare the balance with the applied ledger entries
#[utoipa::path(
    get,
    path = "/points/reconcile",
    responses(
        (status = 200, description = "Reconciliation report", body = ReconciliationResponse),
        (status = 401, description = "No member session", body = crate::dtos::ErrorResponse)
    ),
    tag = "Points"
)]
pub async fn reconcile(
    State(state): State<AppState>,
    SessionMember(session): SessionMember,
) -> Result<Envelope<ReconciliationResponse>, AppError> {
    let report = state.ledger.reconcile(session.member_id).await?;
    Ok(Envelope::new(ReconciliationResponse::from(report)))
}
