//! ============================================================================
//! Entitlement Resolver - Subscription tier lookup for meter identities
//! ============================================================================
//! Queries the external account store for the reader's tier. No caching of
//! its own; staleness is whatever the account store provides.
//! ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{Entitlement, SubscriptionTier};
use crate::identity::IdentityClass;

/// Account store owned by the subscription system
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Current tier of an account, None if the account is unknown
    async fn subscription_tier(&self, account_id: &str) -> Result<Option<SubscriptionTier>>;
}

/// Resolves identity classes to entitlements
#[derive(Clone)]
pub struct EntitlementResolver {
    accounts: Arc<dyn AccountDirectory>,
}

impl EntitlementResolver {
    pub fn new(accounts: Arc<dyn AccountDirectory>) -> Self {
        Self { accounts }
    }

    /// Resolve an identity class. Never fails: missing accounts and lookup
    /// failures fall back to the quota-bound `free` tier.
    pub async fn resolve(&self, class: &IdentityClass) -> Entitlement {
        let account_id = match class {
            IdentityClass::Anonymous => return Entitlement::anonymous(),
            IdentityClass::Account(id) => id,
        };

        match self.accounts.subscription_tier(account_id).await {
            Ok(Some(SubscriptionTier::Anonymous)) | Ok(None) => {
                debug!("No subscription on record for account {}, treating as free", account_id);
                Entitlement::for_tier(SubscriptionTier::Free)
            }
            Ok(Some(tier)) => {
                debug!("Account {} resolved to {} tier", account_id, tier);
                Entitlement::for_tier(tier)
            }
            Err(e) => {
                warn!(
                    "Entitlement lookup failed for account {}: {} - treating as free",
                    account_id, e
                );
                Entitlement::for_tier(SubscriptionTier::Free)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;

    struct MapDirectory(HashMap<String, SubscriptionTier>);

    #[async_trait]
    impl AccountDirectory for MapDirectory {
        async fn subscription_tier(&self, account_id: &str) -> Result<Option<SubscriptionTier>> {
            Ok(self.0.get(account_id).copied())
        }
    }

    struct BrokenDirectory;

    #[async_trait]
    impl AccountDirectory for BrokenDirectory {
        async fn subscription_tier(&self, _account_id: &str) -> Result<Option<SubscriptionTier>> {
            Err(anyhow!("account store timed out"))
        }
    }

    fn resolver() -> EntitlementResolver {
        let accounts = HashMap::from([
            ("p".to_string(), SubscriptionTier::Premium),
            ("e".to_string(), SubscriptionTier::Elite),
            ("f".to_string(), SubscriptionTier::Free),
        ]);
        EntitlementResolver::new(Arc::new(MapDirectory(accounts)))
    }

    #[tokio::test]
    async fn test_anonymous_is_quota_bound() {
        let entitlement = resolver().resolve(&IdentityClass::Anonymous).await;
        assert_eq!(entitlement.tier, SubscriptionTier::Anonymous);
        assert!(!entitlement.unconditional_access);
    }

    #[tokio::test]
    async fn test_paid_tiers_are_unconditional() {
        let resolver = resolver();
        for id in ["p", "e"] {
            let entitlement = resolver.resolve(&IdentityClass::Account(id.into())).await;
            assert!(entitlement.unconditional_access, "account {}", id);
        }
    }

    #[tokio::test]
    async fn test_free_and_missing_accounts_are_quota_bound() {
        let resolver = resolver();
        let free = resolver.resolve(&IdentityClass::Account("f".into())).await;
        assert_eq!(free.tier, SubscriptionTier::Free);
        assert!(!free.unconditional_access);

        let missing = resolver.resolve(&IdentityClass::Account("ghost".into())).await;
        assert_eq!(missing.tier, SubscriptionTier::Free);
        assert!(!missing.unconditional_access);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back_to_free() {
        let resolver = EntitlementResolver::new(Arc::new(BrokenDirectory));
        let entitlement = resolver.resolve(&IdentityClass::Account("p".into())).await;
        assert_eq!(entitlement.tier, SubscriptionTier::Free);
        assert!(!entitlement.unconditional_access);
    }
}
