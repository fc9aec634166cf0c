//! Points ledger and the OTP-gated redemption workflow.
//!
//! Every balance change goes through a single store call that locks the
//! member, re-checks the balance and writes the entry; this service only
//! decides which call to make and maps the outcome.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::delivery::{OtpDelivery, OtpNotice};
use super::grant::GrantEngine;
use super::metrics::{record_outcome, EXPIRED_REQUESTS_TOTAL, LEDGER_MUTATIONS_TOTAL};
use super::retry::{with_contention_retry, RetryConfig};
use super::store::{Settlement, Store};
use super::ServiceError;
use crate::models::{
    AccessToken, LedgerEntry, RedemptionStatus, Scope, METHOD_CREDIT, METHOD_OTP_REDEEM,
    METHOD_REDEEM,
};
use crate::utils::token::{digest, generate_otp, matches_digest};
use crate::utils::validate_amount;

/// Largest page returned by history queries.
pub const MAX_PAGE_SIZE: i64 = 100;

/// A balance mutation that has been applied.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub entry: LedgerEntry,
    pub new_balance: Decimal,
    pub client_name: String,
}

/// A freshly opened gated debit. `otp` is plaintext and is never stored.
#[derive(Debug, Clone)]
pub struct GatedDebitRequest {
    pub request_id: Uuid,
    pub otp: String,
    pub expires_at: DateTime<Utc>,
    pub amount: Decimal,
}

/// Balance compared with the sum of applied entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub member_id: Uuid,
    pub balance: Decimal,
    pub credits: Decimal,
    pub debits: Decimal,
    pub consistent: bool,
}

pub struct LedgerService {
    store: Arc<dyn Store>,
    grants: Arc<GrantEngine>,
    delivery: Arc<dyn OtpDelivery>,
    otp_ttl: Duration,
    retry: RetryConfig,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn Store>,
        grants: Arc<GrantEngine>,
        delivery: Arc<dyn OtpDelivery>,
        otp_ttl: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            grants,
            delivery,
            otp_ttl,
            retry,
        }
    }

    /// Debit pre-authorized by a validated access token carrying the spend
    /// capability.
    #[instrument(skip(self, token, description), fields(member_id = %token.member_id, client_id = %token.client_id))]
    pub async fn apply_instant_debit(
        &self,
        token: &AccessToken,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<Mutation, ServiceError> {
        let result = async {
            if !token.scopes.allows_spend() {
                return Err(ServiceError::InsufficientScope(Scope::PointsRedeem.as_str()));
            }
            let amount = validate_amount(amount)?;
            let client = self.grants.validate_client(&token.client_id, None).await?;
            let entry = LedgerEntry::instant_debit(
                token.member_id,
                &token.client_id,
                amount,
                description,
                Utc::now(),
            );
            let new_balance = self.apply(&entry, "apply_instant_debit").await?;
            Ok(Mutation {
                entry,
                new_balance,
                client_name: client.display_name,
            })
        }
        .await;

        record_outcome(&LEDGER_MUTATIONS_TOTAL, METHOD_REDEEM, &result);
        result
    }

    /// Credit authenticated by the partner's client secret.
    #[instrument(skip(self, client_secret, reason, description))]
    pub async fn apply_instant_credit(
        &self,
        client_id: &str,
        client_secret: &str,
        member_id: Uuid,
        amount: Decimal,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<Mutation, ServiceError> {
        let result = async {
            let client = self
                .grants
                .validate_client(client_id, Some(client_secret))
                .await?;
            let amount = validate_amount(amount)?;
            let entry = LedgerEntry::credit(
                member_id,
                &client.client_id,
                amount,
                reason,
                description,
                Utc::now(),
            );
            let new_balance = self.apply(&entry, "apply_instant_credit").await?;
            Ok(Mutation {
                entry,
                new_balance,
                client_name: client.display_name,
            })
        }
        .await;

        record_outcome(&LEDGER_MUTATIONS_TOTAL, METHOD_CREDIT, &result);
        result
    }

    async fn apply(&self, entry: &LedgerEntry, operation: &str) -> Result<Decimal, ServiceError> {
        let store = &self.store;
        let new_balance =
            with_contention_retry(&self.retry, operation, move || store.apply_instant(entry))
                .await?;
        info!(
            entry_id = %entry.entry_id,
            method = entry.method(),
            amount = %entry.amount,
            new_balance = %new_balance,
            "Balance mutation applied"
        );
        Ok(new_balance)
    }

    /// Open a pending debit the member must approve with a one-time code.
    #[instrument(skip(self, client_secret, description))]
    pub async fn request_gated_debit(
        &self,
        client_id: &str,
        client_secret: &str,
        member_id: Uuid,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<GatedDebitRequest, ServiceError> {
        let client = self
            .grants
            .validate_client(client_id, Some(client_secret))
            .await?;
        let amount = validate_amount(amount)?;

        let member = self
            .store
            .find_member(member_id)
            .await?
            .ok_or(ServiceError::NotFound("Member"))?;
        if !member.active {
            return Err(ServiceError::Forbidden("member account is inactive"));
        }
        if amount > member.points_balance {
            return Err(ServiceError::InsufficientBalance {
                available: member.points_balance,
                requested: amount,
            });
        }

        let otp = generate_otp();
        let now = Utc::now();
        let expires_at = now + self.otp_ttl;
        let entry = LedgerEntry::gated_debit(
            member_id,
            &client.client_id,
            amount,
            description,
            digest(&otp),
            expires_at,
            now,
        );
        self.store.insert_pending_debit(&entry).await?;

        let delivered = self
            .delivery
            .deliver(&OtpNotice {
                member_id,
                email: member.email.clone(),
                request_id: entry.entry_id,
                client_name: client.display_name.clone(),
                amount,
                otp: otp.clone(),
                expires_at,
            })
            .await;
        if let Err(e) = delivered {
            // nobody can approve it without the code
            self.store
                .close_pending(entry.entry_id, RedemptionStatus::Rejected, Utc::now())
                .await?;
            return Err(e);
        }

        info!(request_id = %entry.entry_id, amount = %amount, "Redemption request opened");

        Ok(GatedDebitRequest {
            request_id: entry.entry_id,
            otp,
            expires_at,
            amount,
        })
    }

    /// Approve a pending gated debit with its one-time code.
    #[instrument(skip(self, otp))]
    pub async fn approve_gated_debit(
        &self,
        member_id: Uuid,
        request_id: Uuid,
        otp: &str,
    ) -> Result<Mutation, ServiceError> {
        let result = self.try_approve(member_id, request_id, otp).await;
        record_outcome(&LEDGER_MUTATIONS_TOTAL, METHOD_OTP_REDEEM, &result);
        result
    }

    async fn try_approve(
        &self,
        member_id: Uuid,
        request_id: Uuid,
        otp: &str,
    ) -> Result<Mutation, ServiceError> {
        let entry = self.load_owned_pending(member_id, request_id).await?;
        let now = Utc::now();

        if entry.otp_expired(now) {
            if self
                .store
                .close_pending(request_id, RedemptionStatus::Expired, now)
                .await?
            {
                EXPIRED_REQUESTS_TOTAL.with_label_values(&["approval"]).inc();
            }
            return Err(ServiceError::OtpExpired);
        }

        let otp_hash = entry
            .gated()
            .map(|g| g.otp_hash.as_str())
            .ok_or(ServiceError::NotFound("Redemption request"))?;
        if !matches_digest(otp, otp_hash) {
            warn!(request_id = %request_id, "Invalid redemption OTP");
            return Err(ServiceError::InvalidOtp);
        }

        let store = &self.store;
        let settlement = with_contention_retry(&self.retry, "settle_gated_debit", move || {
            store.settle_gated_debit(request_id, now)
        })
        .await?;

        match settlement {
            Settlement::Approved { entry, new_balance } => {
                let client_name = self
                    .grants
                    .validate_client(&entry.client_id, None)
                    .await
                    .map(|c| c.display_name)
                    .unwrap_or_else(|_| entry.client_id.clone());
                info!(request_id = %request_id, new_balance = %new_balance, "Redemption approved");
                Ok(Mutation {
                    entry,
                    new_balance,
                    client_name,
                })
            }
            Settlement::Expired => {
                EXPIRED_REQUESTS_TOTAL.with_label_values(&["approval"]).inc();
                Err(ServiceError::OtpExpired)
            }
            Settlement::InsufficientBalance { available } => {
                info!(request_id = %request_id, "Redemption rejected for insufficient balance");
                Err(ServiceError::InsufficientBalance {
                    available,
                    requested: entry.amount,
                })
            }
            Settlement::NotPending(status) => Err(ServiceError::AlreadyProcessed(status)),
            Settlement::NotFound => Err(ServiceError::NotFound("Redemption request")),
        }
    }

    /// Decline a pending gated debit without touching the balance.
    #[instrument(skip(self))]
    pub async fn reject_gated_debit(
        &self,
        member_id: Uuid,
        request_id: Uuid,
    ) -> Result<LedgerEntry, ServiceError> {
        let mut entry = self.load_owned_pending(member_id, request_id).await?;
        let now = Utc::now();

        if !self
            .store
            .close_pending(request_id, RedemptionStatus::Rejected, now)
            .await?
        {
            // lost a race with approval, rejection or the sweeper
            let status = self
                .store
                .find_entry(request_id)
                .await?
                .and_then(|e| e.status())
                .unwrap_or(RedemptionStatus::Rejected);
            return Err(ServiceError::AlreadyProcessed(status));
        }

        entry.close(RedemptionStatus::Rejected, now);
        info!(request_id = %request_id, "Redemption rejected by member");
        Ok(entry)
    }

    async fn load_owned_pending(
        &self,
        member_id: Uuid,
        request_id: Uuid,
    ) -> Result<LedgerEntry, ServiceError> {
        let entry = self
            .store
            .find_entry(request_id)
            .await?
            .filter(|e| e.gated().is_some())
            .ok_or(ServiceError::NotFound("Redemption request"))?;

        if entry.member_id != member_id {
            warn!(request_id = %request_id, "Redemption request accessed by another member");
            return Err(ServiceError::Forbidden(
                "redemption request belongs to another member",
            ));
        }
        match entry.status() {
            Some(status) if !status.is_pending() => Err(ServiceError::AlreadyProcessed(status)),
            _ => Ok(entry),
        }
    }

    /// Move every lapsed pending request to `expired`. Idempotent.
    #[instrument(skip(self))]
    pub async fn expire_pending_requests(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let expired = self.store.expire_pending(now).await?;
        if expired > 0 {
            EXPIRED_REQUESTS_TOTAL
                .with_label_values(&["sweep"])
                .inc_by(expired as f64);
            info!(expired = expired, "Expired pending redemption requests");
        }
        Ok(expired)
    }

    pub async fn balance(&self, member_id: Uuid) -> Result<Decimal, ServiceError> {
        self.store
            .find_member(member_id)
            .await?
            .map(|m| m.points_balance)
            .ok_or(ServiceError::NotFound("Member"))
    }

    /// Newest first, page size clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn history(
        &self,
        member_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        self.store
            .list_entries(member_id, limit.clamp(1, MAX_PAGE_SIZE), offset.max(0))
            .await
    }

    pub async fn pending(&self, member_id: Uuid) -> Result<Vec<LedgerEntry>, ServiceError> {
        self.store.list_pending(member_id).await
    }

    /// Compare the stored balance with Σ applied credits − Σ applied debits.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, member_id: Uuid) -> Result<Reconciliation, ServiceError> {
        let balance = self.balance(member_id).await?;
        let totals = self.store.ledger_totals(member_id).await?;
        let consistent = totals.net() == balance;
        if !consistent {
            warn!(
                member_id = %member_id,
                balance = %balance,
                net = %totals.net(),
                "Ledger does not reconcile with balance"
            );
        }
        Ok(Reconciliation {
            member_id,
            balance,
            credits: totals.credits,
            debits: totals.debits,
            consistent,
        })
    }
}
