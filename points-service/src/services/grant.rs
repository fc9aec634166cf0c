//! OAuth grant engine: authorization codes, token exchange, refresh rotation
//! and access-token validation.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::metrics::{record_outcome, GRANTS_TOTAL};
use super::store::Store;
use super::{CredentialKind, ServiceError};
use crate::models::{
    AccessToken, AuthorizationCode, GrantKind, PartnerClient, RefreshToken, ScopeSet, TokenGrant,
    TokenPair,
};
use crate::utils::token::{digest, generate_opaque_token, matches_digest};

/// Credential lifetimes.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub auth_code_ttl: Duration,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            auth_code_ttl: Duration::minutes(10),
            access_token_ttl: Duration::minutes(60),
            refresh_token_ttl: Duration::days(14),
        }
    }
}

pub struct GrantEngine {
    store: Arc<dyn Store>,
    policy: TokenPolicy,
}

impl GrantEngine {
    pub fn new(store: Arc<dyn Store>, policy: TokenPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Provision a partner client. Returns the record and its one-time
    /// plaintext secret.
    #[instrument(skip(self, redirect_uris, allowed_scopes, grant_kinds))]
    pub async fn register_client(
        &self,
        display_name: &str,
        redirect_uris: Vec<String>,
        allowed_scopes: ScopeSet,
        grant_kinds: Vec<GrantKind>,
    ) -> Result<(PartnerClient, String), ServiceError> {
        let (client, secret) = PartnerClient::register(
            display_name.to_string(),
            redirect_uris,
            allowed_scopes,
            grant_kinds,
        );
        self.store.insert_client(&client).await?;
        info!(client_id = %client.client_id, "Partner client registered");
        Ok((client, secret))
    }

    /// Look up an active client, checking the secret when one is supplied.
    #[instrument(skip(self, secret))]
    pub async fn validate_client(
        &self,
        client_id: &str,
        secret: Option<&str>,
    ) -> Result<PartnerClient, ServiceError> {
        let client = self
            .store
            .find_client(client_id)
            .await?
            .filter(|c| c.active)
            .ok_or(ServiceError::NotFound("Client"))?;

        if let Some(secret) = secret {
            if !matches_digest(secret, &client.client_secret_hash) {
                warn!(client_id = %client_id, "Client secret mismatch");
                return Err(ServiceError::InvalidCredentials);
            }
        }
        Ok(client)
    }

    /// Requested scopes, defaulting to everything the client may ask for.
    pub fn resolve_scopes(
        &self,
        client: &PartnerClient,
        requested: Option<&str>,
    ) -> Result<ScopeSet, ServiceError> {
        let requested = match requested.map(str::trim) {
            None | Some("") => return Ok(client.allowed_scopes.clone()),
            Some(raw) => ScopeSet::parse(raw).map_err(|e| ServiceError::InvalidScope(e.0))?,
        };
        if !requested.is_subset(&client.allowed_scopes) {
            return Err(ServiceError::InvalidScope(format!(
                "{} exceeds scopes registered for the client",
                requested
            )));
        }
        Ok(requested)
    }

    /// Checks that must pass before the member is asked for consent.
    pub fn check_authorization_request(
        &self,
        client: &PartnerClient,
        redirect_uri: &str,
    ) -> Result<(), ServiceError> {
        if !client.allows_redirect(redirect_uri) {
            return Err(ServiceError::InvalidRedirect);
        }
        if !client.allows_grant(GrantKind::AuthorizationCode) {
            return Err(ServiceError::UnauthorizedClient(
                GrantKind::AuthorizationCode.to_string(),
            ));
        }
        Ok(())
    }

    /// Issue a one-time authorization code for a consenting member.
    #[instrument(skip(self, client, scopes), fields(client_id = %client.client_id))]
    pub async fn issue_authorization_code(
        &self,
        client: &PartnerClient,
        member_id: Uuid,
        redirect_uri: &str,
        scopes: ScopeSet,
    ) -> Result<String, ServiceError> {
        let result = self
            .try_issue_code(client, member_id, redirect_uri, scopes)
            .await;
        record_outcome(&GRANTS_TOTAL, "code_issued", &result);
        result
    }

    async fn try_issue_code(
        &self,
        client: &PartnerClient,
        member_id: Uuid,
        redirect_uri: &str,
        scopes: ScopeSet,
    ) -> Result<String, ServiceError> {
        self.check_authorization_request(client, redirect_uri)?;
        if !scopes.is_subset(&client.allowed_scopes) {
            return Err(ServiceError::InvalidScope(scopes.to_string()));
        }

        let code = generate_opaque_token();
        let now = Utc::now();
        let record = AuthorizationCode {
            code_hash: digest(&code),
            member_id,
            client_id: client.client_id.clone(),
            redirect_uri: redirect_uri.to_string(),
            scopes,
            expiry_utc: now + self.policy.auth_code_ttl,
            created_utc: now,
        };
        self.store.insert_authorization_code(&record).await?;

        info!(member_id = %member_id, scopes = %record.scopes, "Authorization code issued");
        Ok(code)
    }

    /// Redeem an authorization code for an access/refresh pair. Of several
    /// concurrent exchanges of one code at most one succeeds.
    #[instrument(skip(self, code, secret))]
    pub async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        secret: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ServiceError> {
        let result = self
            .try_exchange_code(code, client_id, secret, redirect_uri)
            .await;
        record_outcome(&GRANTS_TOTAL, GrantKind::AuthorizationCode.as_str(), &result);
        result
    }

    async fn try_exchange_code(
        &self,
        code: &str,
        client_id: &str,
        secret: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ServiceError> {
        let client = self.validate_client(client_id, Some(secret)).await?;
        if !client.allows_grant(GrantKind::AuthorizationCode) {
            return Err(ServiceError::UnauthorizedClient(
                GrantKind::AuthorizationCode.to_string(),
            ));
        }

        let code_hash = digest(code);
        let record = self
            .store
            .find_authorization_code(&code_hash)
            .await?
            .ok_or(ServiceError::InvalidGrant("authorization code not found"))?;

        let now = Utc::now();
        if record.is_expired(now) {
            return Err(ServiceError::Expired(CredentialKind::AuthorizationCode));
        }
        if record.client_id != client.client_id {
            warn!(client_id = %client_id, "Authorization code presented by another client");
            return Err(ServiceError::ClientMismatch);
        }
        if record.redirect_uri != redirect_uri {
            return Err(ServiceError::RedirectMismatch);
        }

        let (grant, pair) = self.mint_pair(record.member_id, &client.client_id, record.scopes, now);
        if !self
            .store
            .consume_authorization_code(&code_hash, &pair)
            .await?
        {
            warn!(client_id = %client_id, "Authorization code replayed");
            return Err(ServiceError::InvalidGrant("authorization code already used"));
        }

        info!(member_id = %grant.member_id, client_id = %client_id, "Authorization code exchanged");
        Ok(grant)
    }

    /// Rotate a refresh token: the presented token is revoked and a fresh
    /// pair with the same scopes is issued.
    #[instrument(skip(self, refresh_token, secret))]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        secret: &str,
    ) -> Result<TokenGrant, ServiceError> {
        let result = self.try_refresh(refresh_token, client_id, secret).await;
        record_outcome(&GRANTS_TOTAL, GrantKind::RefreshToken.as_str(), &result);
        result
    }

    async fn try_refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        secret: &str,
    ) -> Result<TokenGrant, ServiceError> {
        let client = self.validate_client(client_id, Some(secret)).await?;
        if !client.allows_grant(GrantKind::RefreshToken) {
            return Err(ServiceError::UnauthorizedClient(
                GrantKind::RefreshToken.to_string(),
            ));
        }

        let token_hash = digest(refresh_token);
        let record: RefreshToken = self
            .store
            .find_refresh_token(&token_hash)
            .await?
            .ok_or(ServiceError::InvalidGrant("refresh token not found"))?;

        if record.client_id != client.client_id {
            return Err(ServiceError::ClientMismatch);
        }
        if record.is_revoked() {
            warn!(member_id = %record.member_id, client_id = %client_id, "Revoked refresh token presented");
            return Err(ServiceError::InvalidGrant("refresh token revoked"));
        }
        let now = Utc::now();
        if record.is_expired(now) {
            return Err(ServiceError::Expired(CredentialKind::RefreshToken));
        }

        let (grant, pair) = self.mint_pair(record.member_id, &client.client_id, record.scopes, now);
        if !self
            .store
            .rotate_refresh_token(&token_hash, now, &pair)
            .await?
        {
            return Err(ServiceError::InvalidGrant("refresh token already used"));
        }

        info!(member_id = %grant.member_id, client_id = %client_id, "Refresh token rotated");
        Ok(grant)
    }

    /// Resolve a bearer token. Tokens without an expiry skip the lifetime check.
    #[instrument(skip_all)]
    pub async fn validate_access_token(&self, token: &str) -> Result<AccessToken, ServiceError> {
        let record = self
            .store
            .find_access_token(&digest(token))
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        if record.is_revoked() {
            return Err(ServiceError::InvalidToken);
        }
        if record.is_expired(Utc::now()) {
            return Err(ServiceError::Expired(CredentialKind::AccessToken));
        }
        Ok(record)
    }

    /// Revoke an access or refresh token held by the authenticated client.
    /// Unknown tokens are not an error.
    #[instrument(skip(self, token, secret))]
    pub async fn revoke(
        &self,
        token: &str,
        client_id: &str,
        secret: &str,
    ) -> Result<bool, ServiceError> {
        let result = async {
            let client = self.validate_client(client_id, Some(secret)).await?;
            self.store
                .revoke_token(&digest(token), &client.client_id, Utc::now())
                .await
        }
        .await;
        record_outcome(&GRANTS_TOTAL, "revoke", &result);
        if let Ok(true) = result {
            info!(client_id = %client_id, "Token revoked");
        }
        result
    }

    fn mint_pair(
        &self,
        member_id: Uuid,
        client_id: &str,
        scopes: ScopeSet,
        now: DateTime<Utc>,
    ) -> (TokenGrant, TokenPair) {
        let access_token = generate_opaque_token();
        let refresh_token = generate_opaque_token();

        let access_expiry =
            (!scopes.is_non_expiring()).then(|| now + self.policy.access_token_ttl);

        let access = AccessToken {
            token_hash: digest(&access_token),
            member_id,
            client_id: client_id.to_string(),
            scopes: scopes.clone(),
            expiry_utc: access_expiry,
            revoked_utc: None,
            created_utc: now,
        };
        let refresh = RefreshToken {
            token_hash: digest(&refresh_token),
            member_id,
            client_id: client_id.to_string(),
            scopes: scopes.clone(),
            expiry_utc: now + self.policy.refresh_token_ttl,
            revoked_utc: None,
            created_utc: now,
        };

        let grant = TokenGrant {
            access_token,
            refresh_token,
            expires_in: access.expires_in(now),
            scopes,
            member_id,
            client_id: client_id.to_string(),
        };
        (grant, TokenPair { access, refresh })
    }
}
