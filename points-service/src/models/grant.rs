//! Authorization code and token models.
//!
//! Stored records hold only the SHA-256 digest of each credential; plaintext
//! values exist only in [`TokenGrant`] and in the code handed back to the
//! partner.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::ScopeSet;

/// Short-lived, one-time authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code_hash: String,
    pub member_id: Uuid,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: ScopeSet,
    pub expiry_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl AuthorizationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }
}

/// Bearer access token record.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token_hash: String,
    pub member_id: Uuid,
    pub client_id: String,
    pub scopes: ScopeSet,
    /// `None` for non-expiring tokens, which end only through revocation.
    pub expiry_utc: Option<DateTime<Utc>>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_utc.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_utc.is_some_and(|expiry| now >= expiry)
    }

    /// Remaining lifetime in seconds, `None` when the token never expires.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiry_utc
            .map(|expiry| (expiry - now).num_seconds().max(0))
    }
}

/// Refresh token record. Rotated on every use.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token_hash: String,
    pub member_id: Uuid,
    pub client_id: String,
    pub scopes: ScopeSet,
    pub expiry_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_utc.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }
}

/// Records persisted together when a grant succeeds.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// Plaintext credentials returned to the partner exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: Option<i64>,
    pub scopes: ScopeSet,
    pub member_id: Uuid,
    pub client_id: String,
}
