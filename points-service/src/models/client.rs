//! Partner client model - registered third-party applications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ScopeSet;
use crate::utils::token::{digest, generate_client_id, generate_opaque_token};

/// OAuth grant kinds a client may be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    AuthorizationCode,
    RefreshToken,
}

impl GrantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantKind::AuthorizationCode => "authorization_code",
            GrantKind::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GrantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantKind::AuthorizationCode),
            "refresh_token" => Ok(GrantKind::RefreshToken),
            _ => Err(format!("Unsupported grant type: {}", s)),
        }
    }
}

/// Partner application record. Read-only to the grant engine.
#[derive(Debug, Clone)]
pub struct PartnerClient {
    pub client_id: String,
    pub client_secret_hash: String,
    pub display_name: String,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: ScopeSet,
    pub grant_kinds: Vec<GrantKind>,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
}

impl PartnerClient {
    /// Register a new client. The plaintext secret is returned exactly once.
    pub fn register(
        display_name: String,
        redirect_uris: Vec<String>,
        allowed_scopes: ScopeSet,
        grant_kinds: Vec<GrantKind>,
    ) -> (Self, String) {
        let secret = generate_opaque_token();
        let client = Self {
            client_id: generate_client_id(),
            client_secret_hash: digest(&secret),
            display_name,
            redirect_uris,
            allowed_scopes,
            grant_kinds,
            active: true,
            created_utc: Utc::now(),
        };
        (client, secret)
    }

    /// Exact-match check against the registered redirect targets.
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    pub fn allows_grant(&self, kind: GrantKind) -> bool {
        self.grant_kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scope;
    use crate::utils::token::matches_digest;

    fn client() -> (PartnerClient, String) {
        PartnerClient::register(
            "Coffee Partner".to_string(),
            vec!["https://partner.example/callback".to_string()],
            ScopeSet::new([Scope::Profile, Scope::PointsRedeem]),
            vec![GrantKind::AuthorizationCode],
        )
    }

    #[test]
    fn registration_stores_only_secret_digest() {
        let (client, secret) = client();
        assert_ne!(client.client_secret_hash, secret);
        assert!(matches_digest(&secret, &client.client_secret_hash));
        assert!(client.active);
    }

    #[test]
    fn redirect_must_match_exactly() {
        let (client, _) = client();
        assert!(client.allows_redirect("https://partner.example/callback"));
        assert!(!client.allows_redirect("https://partner.example/callback/"));
        assert!(!client.allows_redirect("https://partner.example/callback?x=1"));
    }

    #[test]
    fn grant_kinds_are_enforced() {
        let (client, _) = client();
        assert!(client.allows_grant(GrantKind::AuthorizationCode));
        assert!(!client.allows_grant(GrantKind::RefreshToken));
        assert_eq!(
            "refresh_token".parse::<GrantKind>(),
            Ok(GrantKind::RefreshToken)
        );
        assert!("password".parse::<GrantKind>().is_err());
    }
}
