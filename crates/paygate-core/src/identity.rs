//! ============================================================================
//! Identity Resolver - Meter identity and day bucket for a request
//! ============================================================================
//! Anonymous readers are keyed by client address, authenticated readers by
//! account id. The day bucket is always computed here, in one fixed reference
//! timezone, so every component agrees on "today".
//! ============================================================================

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Address used when no client address can be determined
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Format of the day component in meter keys and payloads
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance_days(&self, days: i64) {
        if let Ok(mut guard) = self.now.write() {
            *guard += Duration::days(days);
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Calendar-day bucketing in a fixed reference timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBucket {
    offset: FixedOffset,
}

impl DayBucket {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Reference timezone given as minutes east of UTC
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }
}

impl Default for DayBucket {
    fn default() -> Self {
        Self::utc()
    }
}

/// Who is reading, as far as metering is concerned
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IdentityClass {
    Anonymous,
    Account(String),
}

impl fmt::Display for IdentityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityClass::Anonymous => write!(f, "anonymous"),
            IdentityClass::Account(id) => write!(f, "account:{}", id),
        }
    }
}

/// Inbound request metadata relevant to identity
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Direct peer address of the connection
    pub peer_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` header value
    pub forwarded_for: Option<String>,
    /// Account id of an authenticated session
    pub account_id: Option<String>,
}

impl RequestMeta {
    pub fn from_peer(peer_addr: IpAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
            ..Self::default()
        }
    }

    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Resolved meter identity for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Opaque meter key (`ip:<addr>` or `account:<id>`)
    pub key: String,
    pub class: IdentityClass,
    pub day: NaiveDate,
    /// True when the address could not be resolved and the sentinel is used
    pub degraded: bool,
}

/// Derives meter identities from requests
#[derive(Clone)]
pub struct IdentityResolver {
    bucket: DayBucket,
    clock: Arc<dyn Clock>,
}

impl IdentityResolver {
    pub fn new(bucket: DayBucket, clock: Arc<dyn Clock>) -> Self {
        Self { bucket, clock }
    }

    /// Resolver on the wall clock with UTC days
    pub fn system() -> Self {
        Self::new(DayBucket::utc(), Arc::new(SystemClock))
    }

    pub fn bucket(&self) -> DayBucket {
        self.bucket
    }

    /// Current day in the reference timezone
    pub fn today(&self) -> NaiveDate {
        self.bucket.day_of(self.clock.now())
    }

    /// Resolve a request. Never fails; an unresolvable address degrades to
    /// the shared sentinel identity.
    pub fn resolve(&self, meta: &RequestMeta) -> ResolvedIdentity {
        let day = self.today();

        if let Some(account) = meta
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
        {
            return ResolvedIdentity {
                key: format!("account:{}", account),
                class: IdentityClass::Account(account.to_string()),
                day,
                degraded: false,
            };
        }

        let address = meta
            .forwarded_for
            .as_deref()
            .and_then(first_forwarded_address)
            .or(meta.peer_addr);

        match address {
            Some(addr) => {
                debug!("Resolved anonymous identity {} for {}", addr, day);
                ResolvedIdentity {
                    key: format!("ip:{}", addr),
                    class: IdentityClass::Anonymous,
                    day,
                    degraded: false,
                }
            }
            None => {
                warn!("Identity unresolved: no usable client address, using sentinel");
                ResolvedIdentity {
                    key: format!("ip:{}", UNKNOWN_ADDRESS),
                    class: IdentityClass::Anonymous,
                    day,
                    degraded: true,
                }
            }
        }
    }
}

/// First hop of a forwarded-for chain, if it parses as an address.
/// Accepts bare addresses, `addr:port` and `[v6]:port`.
fn first_forwarded_address(chain: &str) -> Option<IpAddr> {
    let first = chain.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }

    if let Ok(ip) = first.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = first.parse::<SocketAddr>() {
        return Some(sock.ip());
    }

    warn!("Ignoring unparseable forwarded address '{}'", first);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn resolver_at(now: DateTime<Utc>) -> IdentityResolver {
        IdentityResolver::new(DayBucket::utc(), Arc::new(FixedClock::new(now)))
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_prefers_first_forwarded_address() {
        let resolver = resolver_at(noon());
        let meta = RequestMeta::from_peer("10.0.0.1".parse().unwrap())
            .with_forwarded_for("203.0.113.7, 10.0.0.2, 10.0.0.1");

        let identity = resolver.resolve(&meta);
        assert_eq!(identity.key, "ip:203.0.113.7");
        assert_eq!(identity.class, IdentityClass::Anonymous);
        assert!(!identity.degraded);
    }

    #[test]
    fn test_falls_back_to_peer_address() {
        let resolver = resolver_at(noon());
        let meta = RequestMeta::from_peer("198.51.100.4".parse().unwrap());
        assert_eq!(resolver.resolve(&meta).key, "ip:198.51.100.4");

        let garbage = RequestMeta::from_peer("198.51.100.4".parse().unwrap())
            .with_forwarded_for("not-an-address");
        assert_eq!(resolver.resolve(&garbage).key, "ip:198.51.100.4");
    }

    #[test]
    fn test_forwarded_address_with_port() {
        assert_eq!(
            first_forwarded_address("[2001:db8::1]:443, 10.0.0.1"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(
            first_forwarded_address("192.0.2.9:5000"),
            Some("192.0.2.9".parse().unwrap())
        );
        assert_eq!(first_forwarded_address(" , 10.0.0.1"), None);
    }

    #[test]
    fn test_unresolvable_degrades_to_sentinel() {
        let resolver = resolver_at(noon());
        let identity = resolver.resolve(&RequestMeta::default());
        assert_eq!(identity.key, "ip:unknown");
        assert!(identity.degraded);
    }

    #[test]
    fn test_account_session_wins() {
        let resolver = resolver_at(noon());
        let meta = RequestMeta::from_peer("10.0.0.1".parse().unwrap()).with_account("acct-42");

        let identity = resolver.resolve(&meta);
        assert_eq!(identity.key, "account:acct-42");
        assert_eq!(identity.class, IdentityClass::Account("acct-42".into()));
        assert_eq!(identity.class.to_string(), "account:acct-42");
    }

    #[test]
    fn test_blank_account_is_anonymous() {
        let resolver = resolver_at(noon());
        let meta = RequestMeta::from_peer("10.0.0.1".parse().unwrap()).with_account("  ");
        assert_eq!(resolver.resolve(&meta).class, IdentityClass::Anonymous);
    }

    #[test]
    fn test_day_uses_reference_timezone() {
        // 23:30 UTC is already the next day at UTC+2
        let late = Utc.with_ymd_and_hms(2026, 3, 14, 23, 30, 0).unwrap();
        let utc = DayBucket::utc();
        let plus_two = DayBucket::from_offset_minutes(120).unwrap();

        assert_eq!(utc.day_of(late), NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
        assert_eq!(plus_two.day_of(late), NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
    }

    #[test]
    fn test_invalid_offset_rejected() {
        assert!(DayBucket::from_offset_minutes(24 * 60).is_none());
        assert!(DayBucket::from_offset_minutes(-330).is_some());
    }

    #[test]
    fn test_fixed_clock_advances_day() {
        let clock = Arc::new(FixedClock::new(noon()));
        let resolver = IdentityResolver::new(DayBucket::utc(), clock.clone());
        let before = resolver.today();
        clock.advance_days(1);
        assert_eq!(resolver.today(), before.succ_opt().unwrap());
    }
}
