//! Interactive login and consent handshake records.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ScopeSet;

/// Authenticated member session, keyed by an opaque identifier.
#[derive(Debug, Clone)]
pub struct MemberSession {
    pub session_id: String,
    pub member_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

impl MemberSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }
}

/// Authorization request awaiting the member's consent decision.
///
/// Holds the originally requested redirect target, scopes and state so the
/// consent step cannot alter them. `member_id` is the member the request is
/// bound to; only that member can view or decide it.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub request_id: String,
    pub client_id: String,
    pub client_name: String,
    pub redirect_uri: String,
    pub scopes: ScopeSet,
    pub state: Option<String>,
    pub member_id: Option<Uuid>,
    pub expiry_utc: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }
}
