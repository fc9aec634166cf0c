//! Ledger entry model for member point mutations.
//!
//! Credits, instant debits and OTP-gated debits share one append-only record
//! type. Only a gated debit carries workflow state; it leaves `pending`
//! exactly once.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Entry direction (credit or debit) from the member's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Workflow status of a gated debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RedemptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown redemption status: {}", other)),
        }
    }
}

/// OTP workflow fields of a gated debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatedDebit {
    pub status: RedemptionStatus,
    pub otp_hash: String,
    pub otp_expiry_utc: DateTime<Utc>,
}

/// What kind of mutation an entry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Partner-initiated credit, applied on creation.
    Credit { reason: Option<String> },
    /// Token-authorized debit, applied on creation.
    InstantDebit,
    /// Debit applied only after the member approves it with the one-time code.
    GatedDebit(GatedDebit),
}

pub const METHOD_CREDIT: &str = "credit";
pub const METHOD_REDEEM: &str = "redeem";
pub const METHOD_OTP_REDEEM: &str = "otp_redeem";

/// Immutable record of one balance mutation (or one pending request for one).
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub member_id: Uuid,
    pub client_id: String,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    fn base(
        member_id: Uuid,
        client_id: &str,
        amount: Decimal,
        kind: EntryKind,
        description: Option<String>,
        now: DateTime<Utc>,
        completed: bool,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            member_id,
            client_id: client_id.to_string(),
            amount,
            kind,
            description,
            created_utc: now,
            completed_utc: completed.then_some(now),
        }
    }

    pub fn credit(
        member_id: Uuid,
        client_id: &str,
        amount: Decimal,
        reason: Option<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(
            member_id,
            client_id,
            amount,
            EntryKind::Credit { reason },
            description,
            now,
            true,
        )
    }

    pub fn instant_debit(
        member_id: Uuid,
        client_id: &str,
        amount: Decimal,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(
            member_id,
            client_id,
            amount,
            EntryKind::InstantDebit,
            description,
            now,
            true,
        )
    }

    /// Pending gated debit; `otp_hash` is the digest of the code handed to the member.
    pub fn gated_debit(
        member_id: Uuid,
        client_id: &str,
        amount: Decimal,
        description: Option<String>,
        otp_hash: String,
        otp_expiry_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(
            member_id,
            client_id,
            amount,
            EntryKind::GatedDebit(GatedDebit {
                status: RedemptionStatus::Pending,
                otp_hash,
                otp_expiry_utc,
            }),
            description,
            now,
            false,
        )
    }

    pub fn direction(&self) -> Direction {
        match self.kind {
            EntryKind::Credit { .. } => Direction::Credit,
            EntryKind::InstantDebit | EntryKind::GatedDebit(_) => Direction::Debit,
        }
    }

    /// Method tag persisted alongside the entry.
    pub fn method(&self) -> &'static str {
        match self.kind {
            EntryKind::Credit { .. } => METHOD_CREDIT,
            EntryKind::InstantDebit => METHOD_REDEEM,
            EntryKind::GatedDebit(_) => METHOD_OTP_REDEEM,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Credit { reason } => reason.as_deref(),
            _ => None,
        }
    }

    /// Workflow status; `None` for instant entries.
    pub fn status(&self) -> Option<RedemptionStatus> {
        match &self.kind {
            EntryKind::GatedDebit(gated) => Some(gated.status),
            _ => None,
        }
    }

    pub fn gated(&self) -> Option<&GatedDebit> {
        match &self.kind {
            EntryKind::GatedDebit(gated) => Some(gated),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_some_and(|s| s.is_pending())
    }

    /// Whether the entry has moved the member balance.
    pub fn is_applied(&self) -> bool {
        match &self.kind {
            EntryKind::Credit { .. } | EntryKind::InstantDebit => true,
            EntryKind::GatedDebit(gated) => gated.status == RedemptionStatus::Approved,
        }
    }

    /// Balance effect: positive for credits, negative for debits.
    pub fn signed_amount(&self) -> Decimal {
        match self.direction() {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }

    pub fn otp_expired(&self, now: DateTime<Utc>) -> bool {
        self.gated().is_some_and(|g| now >= g.otp_expiry_utc)
    }

    /// Move a pending gated debit to a terminal status. Returns `false` and
    /// leaves the entry untouched otherwise.
    pub fn close(&mut self, status: RedemptionStatus, now: DateTime<Utc>) -> bool {
        if status.is_pending() {
            return false;
        }
        match &mut self.kind {
            EntryKind::GatedDebit(gated) if gated.status.is_pending() => {
                gated.status = status;
                self.completed_utc = Some(now);
                true
            }
            _ => false,
        }
    }
}

/// Sums of applied entries for one member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub credits: Decimal,
    pub debits: Decimal,
}

impl LedgerTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        entries
            .into_iter()
            .filter(|e| e.is_applied())
            .fold(Self::default(), |mut totals, entry| {
                match entry.direction() {
                    Direction::Credit => totals.credits += entry.amount,
                    Direction::Debit => totals.debits += entry.amount,
                }
                totals
            })
    }

    pub fn net(&self) -> Decimal {
        self.credits - self.debits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn pending(now: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry::gated_debit(
            Uuid::new_v4(),
            "pc_test",
            dec("25"),
            None,
            "digest".to_string(),
            now + Duration::minutes(10),
            now,
        )
    }

    #[test]
    fn instant_entries_have_no_status() {
        let now = Utc::now();
        let entry = LedgerEntry::instant_debit(Uuid::new_v4(), "pc_test", dec("50"), None, now);
        assert_eq!(entry.status(), None);
        assert_eq!(entry.method(), "redeem");
        assert_eq!(entry.direction(), Direction::Debit);
        assert_eq!(entry.signed_amount(), dec("-50"));
        assert_eq!(entry.completed_utc, Some(now));
        assert!(entry.is_applied());
    }

    #[test]
    fn gated_debit_starts_pending_and_unapplied() {
        let entry = pending(Utc::now());
        assert_eq!(entry.status(), Some(RedemptionStatus::Pending));
        assert_eq!(entry.method(), "otp_redeem");
        assert!(entry.completed_utc.is_none());
        assert!(!entry.is_applied());
    }

    #[test]
    fn pending_closes_exactly_once() {
        let now = Utc::now();
        let mut entry = pending(now);
        assert!(entry.close(RedemptionStatus::Approved, now));
        assert!(entry.is_applied());
        assert!(!entry.close(RedemptionStatus::Rejected, now));
        assert_eq!(entry.status(), Some(RedemptionStatus::Approved));
    }

    #[test]
    fn cannot_close_to_pending_or_close_instant_entries() {
        let now = Utc::now();
        let mut gated = pending(now);
        assert!(!gated.close(RedemptionStatus::Pending, now));

        let mut credit = LedgerEntry::credit(Uuid::new_v4(), "pc_test", dec("5"), None, None, now);
        assert!(!credit.close(RedemptionStatus::Approved, now));
    }

    #[test]
    fn otp_expiry_is_inclusive_of_deadline() {
        let now = Utc::now();
        let entry = pending(now);
        assert!(!entry.otp_expired(now));
        assert!(entry.otp_expired(now + Duration::minutes(10)));
    }

    #[test]
    fn totals_only_count_applied_entries() {
        let now = Utc::now();
        let member = Uuid::new_v4();
        let mut approved = pending(now);
        approved.close(RedemptionStatus::Approved, now);
        let mut rejected = pending(now);
        rejected.close(RedemptionStatus::Rejected, now);

        let entries = vec![
            LedgerEntry::credit(member, "pc_test", dec("200"), None, None, now),
            LedgerEntry::instant_debit(member, "pc_test", dec("50"), None, now),
            approved,
            rejected,
            pending(now),
        ];

        let totals = LedgerTotals::from_entries(&entries);
        assert_eq!(totals.credits, dec("200"));
        assert_eq!(totals.debits, dec("75"));
        assert_eq!(totals.net(), dec("125"));
    }

    #[test]
    fn status_parses_round_trip_names() {
        assert_eq!("expired".parse::<RedemptionStatus>(), Ok(RedemptionStatus::Expired));
        assert!("done".parse::<RedemptionStatus>().is_err());
    }
}
