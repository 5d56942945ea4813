//! KV entry with optional expiry.

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone)]
pub(crate) struct KvEntry {
    pub(crate) value: Value,
    /// Set when the entry was written with a TTL. The expiry timer does the
    /// removal; reads also treat a past deadline as missing.
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    pub(crate) fn new(value: Value, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    #[test]
    fn entries_without_ttl_never_expire() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = KvEntry::new(json!(1), None);
        assert!(!entry.is_expired(now + Duration::days(365)));

        let entry = KvEntry::new(json!(1), Some(now + Duration::seconds(1)));
        assert!(!entry.is_expired(now + Duration::seconds(1)));
        assert!(entry.is_expired(now + Duration::milliseconds(1_001)));
    }
}
