//! Short-lived member sessions and pending consent records.
//!
//! Both live in process memory with lazy expiry; identifiers handed to the
//! browser are opaque and only their digests are used as keys.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::ServiceError;
use crate::models::{MemberSession, PartnerClient, PendingAuthorization, ScopeSet};
use crate::utils::token::{digest, generate_opaque_token};

pub struct SessionRegistry {
    sessions: DashMap<String, MemberSession>,
    authorizations: DashMap<String, PendingAuthorization>,
    session_ttl: Duration,
    consent_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(session_ttl: Duration, consent_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            authorizations: DashMap::new(),
            session_ttl,
            consent_ttl,
        }
    }

    /// Start a session; the returned record carries the plaintext id.
    pub fn create_session(&self, member_id: Uuid) -> MemberSession {
        let now = Utc::now();
        let session = MemberSession {
            session_id: generate_opaque_token(),
            member_id,
            created_utc: now,
            expiry_utc: now + self.session_ttl,
        };
        self.sessions
            .insert(digest(&session.session_id), session.clone());
        tracing::info!(member_id = %member_id, "Member session started");
        session
    }

    pub fn resolve_session(&self, session_id: &str) -> Option<MemberSession> {
        let key = digest(session_id);
        let session = self.sessions.get(&key).map(|s| s.clone())?;
        if session.is_expired(Utc::now()) {
            self.sessions.remove(&key);
            return None;
        }
        Some(session)
    }

    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.remove(&digest(session_id)).is_some()
    }

    /// Record an authorization request awaiting consent. Without a member it
    /// stays unbound until the first member to open it after logging in.
    pub fn begin_authorization(
        &self,
        client: &PartnerClient,
        redirect_uri: String,
        scopes: ScopeSet,
        state: Option<String>,
        member_id: Option<Uuid>,
    ) -> PendingAuthorization {
        let pending = PendingAuthorization {
            request_id: generate_opaque_token(),
            client_id: client.client_id.clone(),
            client_name: client.display_name.clone(),
            redirect_uri,
            scopes,
            state,
            member_id,
            expiry_utc: Utc::now() + self.consent_ttl,
        };
        self.authorizations
            .insert(digest(&pending.request_id), pending.clone());
        pending
    }

    /// Live authorization request as seen by `member_id`, binding it to that
    /// member if nobody holds it yet.
    pub fn pending_authorization(
        &self,
        request_id: &str,
        member_id: Uuid,
    ) -> Result<PendingAuthorization, ServiceError> {
        let key = digest(request_id);
        let now = Utc::now();
        self.authorizations.remove_if(&key, |_, p| p.is_expired(now));

        let mut pending = self
            .authorizations
            .get_mut(&key)
            .ok_or(ServiceError::NotFound("Authorization request"))?;
        match pending.member_id {
            Some(owner) if owner != member_id => {
                tracing::warn!(member_id = %member_id, "Authorization request opened by another member");
                Err(ServiceError::Forbidden(
                    "authorization request belongs to another member",
                ))
            }
            Some(_) => Ok(pending.value().clone()),
            None => {
                pending.member_id = Some(member_id);
                Ok(pending.value().clone())
            }
        }
    }

    /// Remove and return a live authorization request. A request can be
    /// decided only once, and only by the member it is bound to.
    pub fn take_authorization(
        &self,
        request_id: &str,
        member_id: Uuid,
    ) -> Result<PendingAuthorization, ServiceError> {
        let key = digest(request_id);
        let now = Utc::now();
        let removed = self.authorizations.remove_if(&key, |_, p| {
            p.is_expired(now) || p.member_id.map_or(true, |owner| owner == member_id)
        });

        match removed {
            Some((_, pending)) if !pending.is_expired(now) => Ok(pending),
            Some(_) => Err(ServiceError::NotFound("Authorization request")),
            None if self.authorizations.contains_key(&key) => {
                tracing::warn!(member_id = %member_id, "Authorization request decided by another member");
                Err(ServiceError::Forbidden(
                    "authorization request belongs to another member",
                ))
            }
            None => Err(ServiceError::NotFound("Authorization request")),
        }
    }

    /// Drop every expired session and authorization request.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len() + self.authorizations.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        self.authorizations.retain(|_, p| !p.is_expired(now));
        before.saturating_sub(self.sessions.len() + self.authorizations.len())
    }
}
