//! Scope model - named capabilities carried by codes and tokens.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A capability a partner may be granted on a member's behalf.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Scope {
    /// Identity fields (name, email) in userinfo.
    #[serde(rename = "profile")]
    Profile,
    /// Points balance in userinfo.
    #[serde(rename = "balance:read")]
    BalanceRead,
    /// Spend points through instant redemption.
    #[serde(rename = "points:redeem")]
    PointsRedeem,
    /// Spend capability for long-lived integrations. Access tokens carrying it
    /// never expire and end only through revocation.
    #[serde(rename = "points:redeem:persistent")]
    PointsRedeemPersistent,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Profile => "profile",
            Scope::BalanceRead => "balance:read",
            Scope::PointsRedeem => "points:redeem",
            Scope::PointsRedeemPersistent => "points:redeem:persistent",
        }
    }

    /// Short human-readable description for the consent step.
    pub fn description(&self) -> &'static str {
        match self {
            Scope::Profile => "Read your name and email address",
            Scope::BalanceRead => "Read your points balance",
            Scope::PointsRedeem => "Spend your points",
            Scope::PointsRedeemPersistent => "Spend your points until you revoke access",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scope: {0}")]
pub struct UnknownScope(pub String);

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Scope::Profile),
            "balance:read" => Ok(Scope::BalanceRead),
            "points:redeem" => Ok(Scope::PointsRedeem),
            "points:redeem:persistent" => Ok(Scope::PointsRedeemPersistent),
            other => Err(UnknownScope(other.to_string())),
        }
    }
}

/// Ordered, de-duplicated set of scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<Scope>);

impl ScopeSet {
    pub fn new(scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self(scopes.into_iter().collect())
    }

    /// Parse an RFC 6749 space-delimited scope string.
    pub fn parse(raw: &str) -> Result<Self, UnknownScope> {
        raw.split_whitespace()
            .map(Scope::from_str)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Rebuild from persisted scope names.
    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Result<Self, UnknownScope> {
        values
            .iter()
            .map(|v| Scope::from_str(v.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|s| s.as_str().to_string()).collect()
    }

    pub fn contains(&self, scope: Scope) -> bool {
        self.0.contains(&scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_subset(&self, other: &ScopeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.0.iter()
    }

    /// Whether the holder may spend the member's points.
    pub fn allows_spend(&self) -> bool {
        self.contains(Scope::PointsRedeem) || self.contains(Scope::PointsRedeemPersistent)
    }

    /// Access tokens minted for this set carry no expiry.
    pub fn is_non_expiring(&self) -> bool {
        self.contains(Scope::PointsRedeemPersistent)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(Scope::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&joined)
    }
}
