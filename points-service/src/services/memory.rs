//! In-process [`Store`] used by tests and local development.
//!
//! All state sits behind one mutex, so every trait method is trivially atomic
//! and concurrent callers serialize exactly as the row locks do in Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{Settlement, Store};
use super::ServiceError;
use crate::models::{
    AccessToken, AuthorizationCode, Direction, LedgerEntry, LedgerTotals, Member, PartnerClient,
    RedemptionStatus, RefreshToken, TokenPair,
};

#[derive(Default)]
struct Inner {
    members: HashMap<Uuid, Member>,
    clients: HashMap<String, PartnerClient>,
    codes: HashMap<String, AuthorizationCode>,
    access_tokens: HashMap<String, AccessToken>,
    refresh_tokens: HashMap<String, RefreshToken>,
    /// Append order doubles as creation order.
    entries: Vec<LedgerEntry>,
}

impl Inner {
    fn persist_pair(&mut self, pair: &TokenPair) {
        self.access_tokens
            .insert(pair.access.token_hash.clone(), pair.access.clone());
        self.refresh_tokens
            .insert(pair.refresh.token_hash.clone(), pair.refresh.clone());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ServiceError> {
        self.inner
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.lock().map(|_| ())
    }

    async fn insert_member(&self, member: &Member) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        if inner.members.values().any(|m| m.email == member.email) {
            return Err(ServiceError::AlreadyExists("Member"));
        }
        inner.members.insert(member.member_id, member.clone());
        Ok(())
    }

    async fn find_member(&self, member_id: Uuid) -> Result<Option<Member>, ServiceError> {
        Ok(self.lock()?.members.get(&member_id).cloned())
    }

    async fn find_member_by_email(&self, email: &str) -> Result<Option<Member>, ServiceError> {
        Ok(self
            .lock()?
            .members
            .values()
            .find(|m| m.email == email)
            .cloned())
    }

    async fn insert_client(&self, client: &PartnerClient) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        if inner.clients.contains_key(&client.client_id) {
            return Err(ServiceError::AlreadyExists("Client"));
        }
        inner
            .clients
            .insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn find_client(&self, client_id: &str) -> Result<Option<PartnerClient>, ServiceError> {
        Ok(self.lock()?.clients.get(client_id).cloned())
    }

    async fn set_member_active(&self, member_id: Uuid, active: bool) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        Ok(match inner.members.get_mut(&member_id) {
            Some(member) => {
                member.active = active;
                true
            }
            None => false,
        })
    }

    async fn set_client_active(&self, client_id: &str, active: bool) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        Ok(match inner.clients.get_mut(client_id) {
            Some(client) => {
                client.active = active;
                true
            }
            None => false,
        })
    }

    async fn insert_authorization_code(
        &self,
        code: &AuthorizationCode,
    ) -> Result<(), ServiceError> {
        self.lock()?
            .codes
            .insert(code.code_hash.clone(), code.clone());
        Ok(())
    }

    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, ServiceError> {
        Ok(self.lock()?.codes.get(code_hash).cloned())
    }

    async fn consume_authorization_code(
        &self,
        code_hash: &str,
        pair: &TokenPair,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        if inner.codes.remove(code_hash).is_none() {
            return Ok(false);
        }
        inner.persist_pair(pair);
        Ok(true)
    }

    async fn find_access_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessToken>, ServiceError> {
        Ok(self.lock()?.access_tokens.get(token_hash).cloned())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        Ok(self.lock()?.refresh_tokens.get(token_hash).cloned())
    }

    async fn rotate_refresh_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        pair: &TokenPair,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        match inner.refresh_tokens.get_mut(token_hash) {
            Some(token) if !token.is_revoked() => token.revoked_utc = Some(now),
            _ => return Ok(false),
        }
        inner.persist_pair(pair);
        Ok(true)
    }

    async fn revoke_token(
        &self,
        token_hash: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        if let Some(token) = inner.access_tokens.get_mut(token_hash) {
            if token.client_id == client_id && !token.is_revoked() {
                token.revoked_utc = Some(now);
                return Ok(true);
            }
        }
        if let Some(token) = inner.refresh_tokens.get_mut(token_hash) {
            if token.client_id == client_id && !token.is_revoked() {
                token.revoked_utc = Some(now);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn apply_instant(&self, entry: &LedgerEntry) -> Result<Decimal, ServiceError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let member = inner
            .members
            .get_mut(&entry.member_id)
            .ok_or(ServiceError::NotFound("Member"))?;
        if !member.active {
            return Err(ServiceError::Forbidden("member account is inactive"));
        }
        let new_balance = member
            .balance_after(entry.direction(), entry.amount)
            .ok_or(ServiceError::InsufficientBalance {
                available: member.points_balance,
                requested: entry.amount,
            })?;
        member.points_balance = new_balance;
        inner.entries.push(entry.clone());
        Ok(new_balance)
    }

    async fn insert_pending_debit(&self, entry: &LedgerEntry) -> Result<(), ServiceError> {
        self.lock()?.entries.push(entry.clone());
        Ok(())
    }

    async fn find_entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, ServiceError> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .find(|e| e.entry_id == entry_id)
            .cloned())
    }

    async fn settle_gated_debit(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Settlement, ServiceError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(entry) = inner.entries.iter_mut().find(|e| e.entry_id == entry_id) else {
            return Ok(Settlement::NotFound);
        };
        match entry.status() {
            None => return Ok(Settlement::NotFound),
            Some(status) if !status.is_pending() => return Ok(Settlement::NotPending(status)),
            Some(_) => {}
        }
        if entry.otp_expired(now) {
            entry.close(RedemptionStatus::Expired, now);
            return Ok(Settlement::Expired);
        }
        let member = inner
            .members
            .get_mut(&entry.member_id)
            .ok_or(ServiceError::NotFound("Member"))?;
        if !member.active {
            return Err(ServiceError::Forbidden("member account is inactive"));
        }
        match member.balance_after(Direction::Debit, entry.amount) {
            Some(new_balance) => {
                member.points_balance = new_balance;
                entry.close(RedemptionStatus::Approved, now);
                Ok(Settlement::Approved {
                    entry: entry.clone(),
                    new_balance,
                })
            }
            None => {
                entry.close(RedemptionStatus::Rejected, now);
                Ok(Settlement::InsufficientBalance {
                    available: member.points_balance,
                })
            }
        }
    }

    async fn close_pending(
        &self,
        entry_id: Uuid,
        status: RedemptionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        Ok(inner
            .entries
            .iter_mut()
            .find(|e| e.entry_id == entry_id)
            .is_some_and(|entry| entry.close(status, now)))
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut inner = self.lock()?;
        let mut expired = 0;
        for entry in inner.entries.iter_mut() {
            if entry.is_pending()
                && entry.otp_expired(now)
                && entry.close(RedemptionStatus::Expired, now)
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_entries(
        &self,
        member_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.member_id == member_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_pending(&self, member_id: Uuid) -> Result<Vec<LedgerEntry>, ServiceError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.member_id == member_id && e.is_pending())
            .cloned()
            .collect())
    }

    async fn ledger_totals(&self, member_id: Uuid) -> Result<LedgerTotals, ServiceError> {
        let inner = self.lock()?;
        Ok(LedgerTotals::from_entries(
            inner.entries.iter().filter(|e| e.member_id == member_id),
        ))
    }
}
