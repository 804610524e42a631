//! ============================================================================
//! Shared Types - Access decisions, content flags and wire payloads
//! ============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::db::IncrementOutcome;

/// Outcome of a content-view request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessOutcome {
    /// Show the full content
    Full,
    /// Daily free-read quota exhausted
    BlockedQuota,
    /// Premium content, subscription required
    BlockedPremium,
}

impl AccessOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessOutcome::Full)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessOutcome::Full => "FULL",
            AccessOutcome::BlockedQuota => "BLOCKED_QUOTA",
            AccessOutcome::BlockedPremium => "BLOCKED_PREMIUM",
        }
    }
}

/// Per-request access decision. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub outcome: AccessOutcome,
    pub remaining: u32,
    pub count_after: u32,
}

impl AccessDecision {
    /// Decision for premium/elite readers; the meter is not touched.
    pub fn unconditional(cap: u32) -> Self {
        Self {
            outcome: AccessOutcome::Full,
            remaining: cap,
            count_after: 0,
        }
    }

    pub fn blocked_premium() -> Self {
        Self {
            outcome: AccessOutcome::BlockedPremium,
            remaining: 0,
            count_after: 0,
        }
    }

    /// Decision derived from the authoritative increment result
    pub fn from_increment(cap: u32, increment: IncrementOutcome) -> Self {
        if increment.accepted {
            Self {
                outcome: AccessOutcome::Full,
                remaining: cap.saturating_sub(increment.count_after),
                count_after: increment.count_after,
            }
        } else {
            Self {
                outcome: AccessOutcome::BlockedQuota,
                remaining: 0,
                count_after: increment.count_after,
            }
        }
    }
}

/// Premium flag of a content item, owned by the content store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFlag {
    pub content_id: String,
    pub premium: bool,
}

impl ContentFlag {
    pub fn new(content_id: impl Into<String>, premium: bool) -> Self {
        Self {
            content_id: content_id.into(),
            premium,
        }
    }
}

/// Errors surfaced by the access decision path
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Metering unavailable: {0}")]
    MeteringUnavailable(String),

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Content lookup failed: {0}")]
    ContentLookupFailed(String),
}

impl GateError {
    /// Stable machine-readable code for HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            GateError::MeteringUnavailable(_) => "metering_unavailable",
            GateError::ContentNotFound(_) => "content_not_found",
            GateError::ContentLookupFailed(_) => "content_unavailable",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GateError::ContentNotFound(_) => 404,
            GateError::MeteringUnavailable(_) | GateError::ContentLookupFailed(_) => 503,
        }
    }
}

// ============================================================================
// Wire payloads for the meter endpoints
// ============================================================================

/// `GET /api/meter` response. Display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub count: u32,
    pub day: NaiveDate,
    pub cap: u32,
    pub remaining: u32,
}

/// `POST /api/meter` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub content_id: String,
}

/// `POST /api/meter` response. `count` is the authoritative meter value the
/// client mirror must adopt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterResponse {
    pub allowed: bool,
    pub count: u32,
    pub outcome: AccessOutcome,
    pub remaining: u32,
    pub day: NaiveDate,
}

/// Error body returned with non-2xx statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_accepted_increment() {
        let decision = AccessDecision::from_increment(
            5,
            IncrementOutcome {
                accepted: true,
                count_after: 2,
            },
        );
        assert_eq!(decision.outcome, AccessOutcome::Full);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.count_after, 2);
    }

    #[test]
    fn test_decision_from_rejected_increment() {
        let decision = AccessDecision::from_increment(
            5,
            IncrementOutcome {
                accepted: false,
                count_after: 5,
            },
        );
        assert_eq!(decision.outcome, AccessOutcome::BlockedQuota);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.count_after, 5);
    }

    #[test]
    fn test_outcome_serializes_screaming_case() {
        let json = serde_json::to_string(&AccessOutcome::BlockedPremium).unwrap();
        assert_eq!(json, "\"BLOCKED_PREMIUM\"");
        assert!(AccessOutcome::Full.is_allowed());
        assert!(!AccessOutcome::BlockedQuota.is_allowed());
    }

    #[test]
    fn test_error_codes() {
        let err = GateError::MeteringUnavailable("down".into());
        assert_eq!(err.code(), "metering_unavailable");
        assert_eq!(err.http_status(), 503);
        assert_eq!(GateError::ContentNotFound("x".into()).http_status(), 404);
    }
}
