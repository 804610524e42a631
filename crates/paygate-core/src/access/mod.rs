//! ============================================================================
//! Access Module - Tiered, metered access to content
//! ============================================================================
//! Decides every content-view request from the reader's subscription tier,
//! the content's premium flag and the daily free-read meter.
//!
//! ## Tiers
//! - **Anonymous**: no session, quota-bound (metered by client address)
//! - **Free**: signed in, quota-bound (metered by account)
//! - **Premium**: unconditional, never metered
//! - **Elite**: unconditional, never metered
//!
//! ## Usage
//! ```rust,ignore
//! use paygate_core::access::{AccessGate, EntitlementResolver};
//!
//! let gate = AccessGate::new(store, EntitlementResolver::new(accounts));
//! let decision = gate.decide(&identity, &content, cap).await?;
//! ```
//! ============================================================================

mod checker;
mod gate;
mod types;

// Re-export public types
pub use checker::{AccountDirectory, EntitlementResolver};
pub use gate::{AccessGate, DEFAULT_STORE_TIMEOUT_MS};
pub use types::{Entitlement, EntitlementClass, SubscriptionTier, UnknownTier};
