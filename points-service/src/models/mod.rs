//! Domain models for points-service.

mod client;
mod grant;
mod ledger;
mod member;
mod scope;
mod session;

pub use client::{GrantKind, PartnerClient};
pub use grant::{AccessToken, AuthorizationCode, RefreshToken, TokenGrant, TokenPair};
pub use ledger::{
    Direction, EntryKind, GatedDebit, LedgerEntry, LedgerTotals, RedemptionStatus,
    METHOD_CREDIT, METHOD_OTP_REDEEM, METHOD_REDEEM,
};
pub use member::Member;
pub use scope::{Scope, ScopeSet, UnknownScope};
pub use session::{MemberSession, PendingAuthorization};
