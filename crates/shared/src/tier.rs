//! Subscription tiers

use serde::{Deserialize, Serialize};

/// Commercial plan a customer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    /// Free tier every customer starts on
    #[default]
    Base,
    /// Paid tier backed by a recurring billing credential
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Base => "base",
            SubscriptionTier::Premium => "premium",
        }
    }

    /// Parse a stored tier name. Unknown values are treated as `None`
    /// so callers decide how to surface corrupt rows.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "base" => Some(SubscriptionTier::Base),
            "premium" => Some(SubscriptionTier::Premium),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, SubscriptionTier::Premium)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
