//! Persistence boundary for points-service.
//!
//! Each method is one atomic unit: implementations must not expose a state in
//! which a code is consumed without its tokens, a balance moved without its
//! entry, or an entry transitioned twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::ServiceError;
use crate::models::{
    AccessToken, AuthorizationCode, LedgerEntry, LedgerTotals, Member, PartnerClient,
    RedemptionStatus, RefreshToken, TokenPair,
};

/// Outcome of settling an OTP-gated debit.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Balance decremented and entry approved in one step.
    Approved {
        entry: LedgerEntry,
        new_balance: Decimal,
    },
    /// Lifetime elapsed; entry moved to `expired`.
    Expired,
    /// Balance no longer covers the amount; entry moved to `rejected`.
    InsufficientBalance { available: Decimal },
    /// Entry had already left `pending`.
    NotPending(RedemptionStatus),
    NotFound,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // Members

    /// `AlreadyExists` when the email is taken.
    async fn insert_member(&self, member: &Member) -> Result<(), ServiceError>;
    async fn find_member(&self, member_id: Uuid) -> Result<Option<Member>, ServiceError>;
    async fn find_member_by_email(&self, email: &str) -> Result<Option<Member>, ServiceError>;
    /// `false` when no such member.
    async fn set_member_active(&self, member_id: Uuid, active: bool) -> Result<bool, ServiceError>;

    // Partner clients

    async fn insert_client(&self, client: &PartnerClient) -> Result<(), ServiceError>;
    async fn find_client(&self, client_id: &str) -> Result<Option<PartnerClient>, ServiceError>;
    async fn set_client_active(&self, client_id: &str, active: bool) -> Result<bool, ServiceError>;

    // Authorization codes

    async fn insert_authorization_code(&self, code: &AuthorizationCode)
        -> Result<(), ServiceError>;
    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, ServiceError>;
    /// Delete the code and persist `pair`. Returns `false`, persisting
    /// nothing, when the code no longer exists.
    async fn consume_authorization_code(
        &self,
        code_hash: &str,
        pair: &TokenPair,
    ) -> Result<bool, ServiceError>;

    // Tokens

    async fn find_access_token(&self, token_hash: &str)
        -> Result<Option<AccessToken>, ServiceError>;
    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError>;
    /// Revoke the presented refresh token and persist `pair`. Returns `false`,
    /// persisting nothing, when the token was already revoked.
    async fn rotate_refresh_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        pair: &TokenPair,
    ) -> Result<bool, ServiceError>;
    /// Revoke an access or refresh token owned by `client_id`. Returns
    /// whether a live token was revoked.
    async fn revoke_token(
        &self,
        token_hash: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    // Ledger

    /// Apply a credit or instant debit: lock the member, check the balance,
    /// move it and append `entry`. Returns the new balance.
    async fn apply_instant(&self, entry: &LedgerEntry) -> Result<Decimal, ServiceError>;
    async fn insert_pending_debit(&self, entry: &LedgerEntry) -> Result<(), ServiceError>;
    async fn find_entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, ServiceError>;
    /// Re-check state, lifetime and balance of a gated debit under lock and
    /// apply it.
    async fn settle_gated_debit(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Settlement, ServiceError>;
    /// Move a pending entry to a terminal status without touching the
    /// balance. Returns `false` when it was no longer pending.
    async fn close_pending(
        &self,
        entry_id: Uuid,
        status: RedemptionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;
    /// Expire every pending entry whose one-time code has lapsed.
    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;
    /// Newest first.
    async fn list_entries(
        &self,
        member_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, ServiceError>;
    async fn list_pending(&self, member_id: Uuid) -> Result<Vec<LedgerEntry>, ServiceError>;
    async fn ledger_totals(&self, member_id: Uuid) -> Result<LedgerTotals, ServiceError>;
}
