//! ============================================================================
//! Access Gate - Paywall decisions for content-view requests
//! ============================================================================
//! Combines entitlement, content flag and the metering store into one of
//! FULL, BLOCKED_QUOTA or BLOCKED_PREMIUM. Store calls run on the blocking
//! pool under a timeout; any store failure surfaces as
//! `GateError::MeteringUnavailable`, never as a grant.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::checker::EntitlementResolver;
use super::types::Entitlement;
use crate::db::{MeteringStore, StoreError};
use crate::identity::ResolvedIdentity;
use crate::types::{AccessDecision, AccessOutcome, ContentFlag, GateError};

/// Default time to wait for the metering store (2 seconds)
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Access decision engine
pub struct AccessGate {
    store: Arc<dyn MeteringStore>,
    entitlements: EntitlementResolver,
    store_timeout: Duration,
}

impl AccessGate {
    pub fn new(store: Arc<dyn MeteringStore>, entitlements: EntitlementResolver) -> Self {
        Self {
            store,
            entitlements,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Entitlement of the requester
    pub async fn entitlement(&self, identity: &ResolvedIdentity) -> Entitlement {
        self.entitlements.resolve(&identity.class).await
    }

    /// Decide one content-view request. The meter is only touched for
    /// quota-bound readers of non-premium content.
    pub async fn decide(
        &self,
        identity: &ResolvedIdentity,
        content: &ContentFlag,
        cap: u32,
    ) -> Result<AccessDecision, GateError> {
        let entitlement = self.entitlement(identity).await;

        if entitlement.unconditional_access {
            debug!(
                "Unconditional access for {} ({} tier) to {}",
                identity.key, entitlement.tier, content.content_id
            );
            return Ok(AccessDecision::unconditional(cap));
        }

        if content.premium {
            info!(
                "Premium content {} blocked for {} ({} tier)",
                content.content_id, identity.key, entitlement.tier
            );
            return Ok(AccessDecision::blocked_premium());
        }

        let key = identity.key.clone();
        let day = identity.day;
        let increment = self
            .with_store("increment", move |store| {
                store.increment_if_under_cap(&key, day, cap)
            })
            .await?;

        let decision = AccessDecision::from_increment(cap, increment);
        match decision.outcome {
            AccessOutcome::BlockedQuota => info!(
                "Quota exhausted for {} on {} ({}/{})",
                identity.key, identity.day, decision.count_after, cap
            ),
            _ => debug!(
                "Free read {} of {} for {} on {}: {}",
                decision.count_after, cap, identity.key, identity.day, content.content_id
            ),
        }
        Ok(decision)
    }

    /// Current count for display. Never used for the decision itself.
    pub async fn peek(&self, identity: &ResolvedIdentity) -> Result<u32, GateError> {
        let key = identity.key.clone();
        let day = identity.day;
        self.with_store("peek", move |store| store.peek(&key, day)).await
    }

    /// Run a store operation on the blocking pool, bounded by the store timeout.
    /// An operation that outlives the timeout may still commit.
    async fn with_store<T, F>(&self, op: &'static str, f: F) -> Result<T, GateError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MeteringStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                error!("Metering store {} failed: {}", op, e);
                Err(GateError::MeteringUnavailable(e.to_string()))
            }
            Ok(Err(e)) => {
                error!("Metering store {} task aborted: {}", op, e);
                Err(GateError::MeteringUnavailable(format!("{} task aborted", op)))
            }
            Err(_) => {
                error!(
                    "Metering store {} timed out after {}ms",
                    op,
                    self.store_timeout.as_millis()
                );
                Err(GateError::MeteringUnavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.store_timeout.as_millis()
                )))
            }
        }
    }
}
