//! ============================================================================
//! Meter Types - Records and results for the redb meter store
//! ============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `(identity, day) -> count` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRecord {
    pub identity: String,
    pub day: NaiveDate,
    pub count: u32,
}

/// Result of the atomic increment-if-under-cap operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementOutcome {
    pub accepted: bool,
    /// Count stored after the operation (unchanged on rejection)
    pub count_after: u32,
}

impl IncrementOutcome {
    pub fn accepted(count_after: u32) -> Self {
        Self {
            accepted: true,
            count_after,
        }
    }

    pub fn rejected(current: u32) -> Self {
        Self {
            accepted: false,
            count_after: current,
        }
    }
}

/// Store-level failure. Converted to `GateError::MeteringUnavailable` at the
/// decision boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Meter store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt meter key: {0}")]
    CorruptKey(String),
}

/// Per-day totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayStats {
    /// Identities metered that day
    pub identities: usize,
    /// Accepted free reads that day
    pub reads: u64,
    /// Identities that reached the cap
    pub exhausted: usize,
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterStats {
    pub total_records: usize,
    pub total_reads: u64,
    pub cap: u32,
    /// Keyed by `YYYY-MM-DD`
    pub days: BTreeMap<String, DayStats>,
}
