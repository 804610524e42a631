//! ============================================================================
//! Access Types - Subscription tiers and entitlement classes
//! ============================================================================
//! Maps subscription tiers onto the two entitlement classes the decision
//! engine cares about: quota-bound and unconditional.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Subscription tiers known to the account store, plus `Anonymous`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    /// No session
    #[default]
    Anonymous,
    /// Signed in, not subscribed
    Free,
    /// Paid subscription
    Premium,
    /// Top paid subscription
    Elite,
}

impl SubscriptionTier {
    /// Entitlement class for this tier
    pub fn entitlement_class(&self) -> EntitlementClass {
        match self {
            SubscriptionTier::Anonymous | SubscriptionTier::Free => EntitlementClass::QuotaBound,
            SubscriptionTier::Premium | SubscriptionTier::Elite => EntitlementClass::Unconditional,
        }
    }

    pub fn grants_unconditional_access(&self) -> bool {
        self.entitlement_class() == EntitlementClass::Unconditional
    }

    /// Get the numeric rank for comparison
    fn rank(&self) -> u8 {
        match self {
            SubscriptionTier::Anonymous => 0,
            SubscriptionTier::Free => 1,
            SubscriptionTier::Premium => 2,
            SubscriptionTier::Elite => 3,
        }
    }

    /// Get human-readable tier name
    pub fn display_name(&self) -> &'static str {
        match self {
            SubscriptionTier::Anonymous => "Anonymous",
            SubscriptionTier::Free => "Free",
            SubscriptionTier::Premium => "Premium",
            SubscriptionTier::Elite => "Elite",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Anonymous => "anonymous",
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Elite => "elite",
        }
    }
}

impl PartialOrd for SubscriptionTier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SubscriptionTier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown tier string from the account store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown subscription tier '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for SubscriptionTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anonymous" => Ok(SubscriptionTier::Anonymous),
            "free" => Ok(SubscriptionTier::Free),
            "premium" => Ok(SubscriptionTier::Premium),
            "elite" => Ok(SubscriptionTier::Elite),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

/// Whether a reader is metered at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementClass {
    /// Limited by the daily free-read meter
    QuotaBound,
    /// Exempt from metering
    Unconditional,
}

/// Resolved entitlement for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub tier: SubscriptionTier,
    pub unconditional_access: bool,
}

impl Entitlement {
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        Self {
            tier,
            unconditional_access: tier.grants_unconditional_access(),
        }
    }

    pub fn anonymous() -> Self {
        Self::for_tier(SubscriptionTier::Anonymous)
    }

    pub fn class(&self) -> EntitlementClass {
        self.tier.entitlement_class()
    }
}
