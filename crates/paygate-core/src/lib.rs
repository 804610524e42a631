//! ============================================================================
//! PAYGATE-CORE: Metered content access
//! ============================================================================
//! This crate decides, for every content-view request, whether the reader
//! sees the full item, hits the premium paywall, or has used up the daily
//! free-read quota:
//! - Identity resolution (client address or account, fixed-timezone day)
//! - redb-backed meter with an atomic increment-if-under-cap
//! - Tier entitlements (premium/elite bypass the meter entirely)
//! - HTTP endpoints (tiny_http) and a client with a display-only mirror
//! ============================================================================

pub mod access;
pub mod catalog;
pub mod client;
pub mod config;
pub mod db;
pub mod identity;
pub mod mirror;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use access::{
    AccessGate, AccountDirectory, Entitlement, EntitlementClass, EntitlementResolver,
    SubscriptionTier,
};
pub use catalog::{ContentCatalog, Directory};
pub use client::{ClientError, MeterClient, MirroredReader};
pub use config::GateConfig;
pub use db::{IncrementOutcome, MeterDb, MeterRecord, MeterStats, MeteringStore, StoreError};
pub use identity::{
    Clock, DayBucket, FixedClock, IdentityClass, IdentityResolver, RequestMeta,
    ResolvedIdentity, SystemClock, DAY_FORMAT,
};
pub use mirror::{ClientMirror, MirrorState};
pub use server::{MeterServer, MeterState, ShutdownHandle};
pub use types::*;
